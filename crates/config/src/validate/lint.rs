//! Configuration linting
//!
//! Checks configuration for operational pitfalls. Lints never fail a load.

use sentinel_ca_common::ChallengeType;

use super::{ValidationResult, ValidationWarning};
use crate::{Config, ExhaustionPolicy, StorageBackend};

/// Lint configuration for operational pitfalls
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.validation.on_exhaustion == ExhaustionPolicy::Stall {
        result.add_warning(ValidationWarning::new(
            "validation on-exhaustion \"stall\" leaves authorizations pending after retries run out",
        ));
    }

    if config.storage.backend == StorageBackend::Memory {
        result.add_warning(ValidationWarning::new(
            "storage backend is 'memory'; accounts, orders and queued validations are lost on restart",
        ));
    }

    if config.server.base_url.starts_with("http://") {
        result.add_warning(ValidationWarning::new(format!(
            "server base-url '{}' is not HTTPS (RFC 8555 requires HTTPS for ACME servers)",
            config.server.base_url
        )));
    }

    if !config.validation.challenge_types.contains(&ChallengeType::Dns01) {
        result.add_warning(ValidationWarning::new(
            "dns-01 is not offered; wildcard identifiers cannot be authorized",
        ));
    }

    if config.validation.challenge_types.contains(&ChallengeType::TlsAlpn01) {
        result.add_warning(ValidationWarning::new(
            "tls-alpn-01 is offered but has no validator; those challenges will fail",
        ));
    }

    let total_backoff = (1..=u64::from(config.validation.max_retries))
        .map(|k| k.saturating_mul(config.validation.retry_backoff_secs))
        .fold(0u64, u64::saturating_add);
    if total_backoff > config.orders.lifetime_hours.saturating_mul(3600) {
        result.add_warning(ValidationWarning::new(format!(
            "retry schedule spans {}s, longer than the order lifetime",
            total_backoff
        )));
    }

    if !config.tidy.enabled {
        result.add_warning(ValidationWarning::new(
            "tidy is disabled; expired nonces, orders and accounts accumulate",
        ));
    }

    result
}
