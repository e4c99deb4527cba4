//! Sentinel CA Library
//!
//! The protocol core of an ACME (RFC 8555) certificate authority: nonces,
//! accounts, orders, authorizations, asynchronous challenge validation and
//! revocation over a pluggable key-value store. HTTP routing and JWS
//! verification live in front of this crate; see [`acme::AcmeService`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sentinel_ca::acme::{NetworkValidator, ResourceStore, SystemClock, ValidationEngine};
//! use sentinel_ca_config::Config;
//!
//! let config = Config::default_embedded()?;
//! let storage = sentinel_ca::storage::open(&config.storage).await?;
//! let store = Arc::new(ResourceStore::new(storage));
//! let validator = Arc::new(NetworkValidator::new(&config.http01, &config.dns01));
//! let settings = (&config.validation).into();
//! let engine = ValidationEngine::new(store, validator, settings, Arc::new(SystemClock));
//! let handle = engine.handle();
//! tokio::spawn(engine.run());
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod storage;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use acme::{AcmeError, AcmeService, Policies, ResourceStore, ValidationEngine};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
