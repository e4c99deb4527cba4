//! Filesystem storage backend
//!
//! Each key maps to one file below the base directory:
//!
//! ```text
//! storage/
//! └── acme/
//!     ├── accounts/<id>
//!     ├── account-thumbprints/<thumbprint>
//!     ├── orders/<account>/<order>
//!     ├── authorizations/<account>/<authz>
//!     ├── validation-queue/<authz>-<challenge-type>
//!     ├── certs/<serial>
//!     └── eab/<key-id>
//! ```
//!
//! Directories are created `0700` and files `0600` on Unix. Each write goes
//! to its own hidden temporary file that is renamed into place, so readers
//! never see a partially written value and concurrent writers of one key
//! never share a temporary file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, trace, warn};

use super::{check_key, Storage, StorageError};

/// File-per-key storage
#[derive(Debug)]
pub struct FileStorage {
    /// Base storage directory
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a new file storage at the given path
    ///
    /// Creates the directory if it doesn't exist and sets restrictive
    /// permissions (0700 on Unix).
    pub async fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path).await?;
        set_dir_permissions(base_path).await?;

        info!(
            storage_path = %base_path.display(),
            "Initialized ACME file storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.base_path.clone(), |path, segment| path.join(segment))
    }

    /// Create every missing directory between the base path and `dir`
    async fn ensure_dirs(&self, dir: &Path) -> Result<(), StorageError> {
        let relative = dir.strip_prefix(&self.base_path).unwrap_or(dir);
        let mut current = self.base_path.clone();
        for component in relative.components() {
            current.push(component);
            match fs::create_dir(&current).await {
                Ok(()) => set_dir_permissions(&current).await?,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn set_dir_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_dir_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(unix)]
async fn set_file_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_file_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        check_key(key)?;
        let path = self.path_for(key);
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        self.ensure_dirs(parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let tmp = parent.join(format!(".{}.{:016x}.tmp", file_name, rand::random::<u64>()));

        let written = async {
            fs::write(&tmp, &value).await?;
            set_file_permissions(&tmp).await?;
            fs::rename(&tmp, &path).await?;
            Ok::<(), StorageError>(())
        }
        .await;
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(
                        path = %tmp.display(),
                        error = %cleanup,
                        "Failed to remove temporary file"
                    );
                }
            }
            return Err(e);
        }

        trace!(key = %key, bytes = value.len(), "Wrote storage entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_key(key)?;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Walk from the deepest directory fully named by the prefix
        let start_dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let root = if start_dir.is_empty() {
            self.base_path.clone()
        } else {
            check_key(start_dir)?;
            self.path_for(start_dir)
        };

        let mut keys = Vec::new();
        let mut pending = vec![(root, start_dir.to_string())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let key = if key_prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", key_prefix, name)
                };

                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
