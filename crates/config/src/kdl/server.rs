//! Server, storage and nonce KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::server::*;

use super::helpers::{get_string_entry, get_uint_entry};

/// Parse server configuration block
pub fn parse_server_config(node: &kdl::KdlNode) -> Result<ServerConfig> {
    trace!("Parsing server configuration block");

    let base_url = get_string_entry(node, "base-url").ok_or_else(|| {
        anyhow::anyhow!(
            "Server block requires a 'base-url' field, e.g., base-url \"https://ca.example.com/acme\""
        )
    })?;

    let config = ServerConfig {
        base_url,
        graceful_shutdown_timeout_secs: get_uint_entry(node, "graceful-shutdown-timeout-secs")?
            .unwrap_or_else(default_graceful_shutdown_timeout),
    };

    trace!(
        base_url = %config.base_url,
        graceful_shutdown_timeout_secs = config.graceful_shutdown_timeout_secs,
        "Parsed server configuration"
    );

    Ok(config)
}

/// Parse storage configuration block
pub fn parse_storage_config(node: &kdl::KdlNode) -> Result<StorageConfig> {
    trace!("Parsing storage configuration block");

    let backend_str = get_string_entry(node, "backend").unwrap_or_else(|| "file".to_string());
    let backend = match backend_str.to_lowercase().as_str() {
        "file" => StorageBackend::File,
        "memory" => StorageBackend::Memory,
        other => {
            return Err(anyhow::anyhow!(
                "Invalid storage backend '{}'. Valid backends: file, memory",
                other
            ));
        }
    };

    let path = get_string_entry(node, "path")
        .map(PathBuf::from)
        .unwrap_or_else(default_storage_path);

    trace!(backend = ?backend, path = %path.display(), "Parsed storage configuration");

    Ok(StorageConfig { backend, path })
}

/// Parse nonce configuration block
pub fn parse_nonce_config(node: &kdl::KdlNode) -> Result<NonceConfig> {
    Ok(NonceConfig {
        ttl_secs: get_uint_entry(node, "ttl-secs")?.unwrap_or_else(default_nonce_ttl),
    })
}
