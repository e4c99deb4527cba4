//! In-memory storage backend
//!
//! Process-local and lost on restart. Used in tests and for single-process
//! experiments; supports fault injection so crash-between-writes paths can
//! be exercised.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::{check_key, Storage, StorageError};

/// DashMap-backed storage
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<DashMap<String, Vec<u8>>>,
    failing_puts: Arc<RwLock<Vec<String>>>,
    failing_deletes: Arc<RwLock<Vec<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` on a key with this prefix fail
    pub fn fail_puts_matching(&self, prefix: impl Into<String>) {
        self.failing_puts.write().push(prefix.into());
    }

    /// Make every subsequent `delete` on a key with this prefix fail
    pub fn fail_deletes_matching(&self, prefix: impl Into<String>) {
        self.failing_deletes.write().push(prefix.into());
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.failing_puts.write().clear();
        self.failing_deletes.write().clear();
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn injected(faults: &RwLock<Vec<String>>, key: &str) -> bool {
        faults.read().iter().any(|prefix| key.starts_with(prefix.as_str()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        check_key(key)?;
        if Self::injected(&self.failing_puts, key) {
            return Err(StorageError::Backend(format!("injected put failure for '{}'", key)));
        }
        trace!(key = %key, bytes = value.len(), "Storing value");
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_key(key)?;
        if Self::injected(&self.failing_deletes, key) {
            return Err(StorageError::Backend(format!(
                "injected delete failure for '{}'",
                key
            )));
        }
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
