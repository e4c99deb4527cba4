//! Durable key-value storage for ACME state
//!
//! The engine only needs four operations from its backing store: point
//! reads, writes and deletes, and listing by key prefix. Keys are
//! `/`-separated paths such as `acme/accounts/<id>`; values are opaque bytes
//! (JSON in practice).
//!
//! Backends are strongly consistent per key and offer no cross-key
//! transactions, so callers order their writes where a crash between two
//! writes matters.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use sentinel_ca_config::{StorageBackend, StorageConfig};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Key-value storage backend
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Read a value; `Ok(None)` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Create or replace a value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Remove a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Every key starting with `prefix`, at any depth, in lexical order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Reject keys that could escape a file backend's root or collide with
/// directory entries
pub(crate) fn check_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment.starts_with('.'))
        || key.contains('\\')
        || key.contains('\0');
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Open the backend selected in configuration
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::File => Ok(Arc::new(FileStorage::new(&config.path).await?)),
    }
}
