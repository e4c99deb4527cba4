//! Server, storage and nonce configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

// ============================================================================
// Server Configuration
// ============================================================================

/// Global server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Externally visible base URL of the ACME directory
    /// (e.g. `https://ca.example.com/acme`). Resource URLs are derived from it.
    #[validate(length(min = 1, message = "server base-url must not be empty"))]
    pub base_url: String,

    /// Grace period for the engine to finish dispatching on shutdown
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Base URL with any trailing slash removed
    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

pub(crate) fn default_base_url() -> String {
    "https://localhost:8443/acme".to_string()
}

pub(crate) fn default_graceful_shutdown_timeout() -> u64 {
    30
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Durable storage backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One file per key under `path`
    #[default]
    File,
    /// Process-local map; state is lost on restart
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Base directory for the file backend
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

pub(crate) fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/sentinel-ca")
}

// ============================================================================
// Nonce Configuration
// ============================================================================

/// Replay-nonce configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NonceConfig {
    /// Lifetime of an issued nonce
    #[serde(default = "default_nonce_ttl")]
    #[validate(range(min = 1, max = 86400, message = "nonce ttl-secs must be 1..=86400"))]
    pub ttl_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_nonce_ttl(),
        }
    }
}

impl NonceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

pub(crate) fn default_nonce_ttl() -> u64 {
    15 * 60
}
