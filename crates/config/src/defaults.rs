//! Default embedded configuration
//!
//! This module provides the configuration that ships with the binary. It is
//! used when no configuration file is provided and documents every block the
//! KDL parser understands.

use crate::engine::{Dns01Config, Http01Config, ValidationConfig};
use crate::policy::{AccountConfig, OrderConfig, TidyConfig};
use crate::server::{NonceConfig, ServerConfig, StorageBackend, StorageConfig};
use crate::Config;

/// Embedded default configuration in KDL format
pub const DEFAULT_CONFIG_KDL: &str = r#"
// Sentinel CA Default Configuration
// Suitable for local experiments. Production deployments should set
// base-url and a persistent storage path.

server {
    base-url "https://localhost:8443/acme"
    graceful-shutdown-timeout-secs 30
}

storage {
    backend "memory"
}

nonce {
    ttl-secs 900
}

validation {
    workers 5
    max-retries 5
    retry-backoff-secs 5
    attempt-timeout-secs 60
    authorization-lifetime-days 15
    on-exhaustion "invalidate"
    challenge-types "http-01" "dns-01"
}

http-01 {
    port 80
    timeout-secs 10
    max-redirects 10
    max-redirect-url-len 2000
    max-body-bytes 512
}

dns-01 {
    timeout-secs 10
}

orders {
    lifetime-hours 24
    certificate-lifetime-days 90
    max-identifiers 100
}

accounts {
    eab-policy "not-required"
    require-tos #false
}

tidy {
    enabled #true
    interval-secs 3600
    account-revoke-after-days 90
    account-delete-grace-days 30
    buffer-hours 24
}
"#;

/// Programmatic equivalent of [`DEFAULT_CONFIG_KDL`]
pub fn create_default_config() -> Config {
    Config {
        server: ServerConfig::default(),
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        },
        nonce: NonceConfig::default(),
        validation: ValidationConfig {
            challenge_types: vec![
                sentinel_ca_common::ChallengeType::Http01,
                sentinel_ca_common::ChallengeType::Dns01,
            ],
            ..ValidationConfig::default()
        },
        http01: Http01Config::default(),
        dns01: Dns01Config::default(),
        orders: OrderConfig::default(),
        accounts: AccountConfig::default(),
        tidy: TidyConfig::default(),
    }
}
