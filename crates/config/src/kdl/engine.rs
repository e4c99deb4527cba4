//! Validation engine and challenge validator KDL parsing.

use anyhow::{Context, Result};
use std::net::IpAddr;
use tracing::trace;

use sentinel_ca_common::ChallengeType;

use crate::engine::*;

use super::helpers::{get_string_entry, get_string_list_entry, get_uint_entry};

/// Parse validation engine configuration block
pub fn parse_validation_config(node: &kdl::KdlNode) -> Result<ValidationConfig> {
    trace!("Parsing validation configuration block");

    let on_exhaustion = match get_string_entry(node, "on-exhaustion") {
        None => ExhaustionPolicy::default(),
        Some(s) => match s.to_lowercase().as_str() {
            "invalidate" => ExhaustionPolicy::Invalidate,
            "stall" => ExhaustionPolicy::Stall,
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid on-exhaustion policy '{}'. Valid policies: invalidate, stall",
                    other
                ));
            }
        },
    };

    let challenge_types = match get_string_list_entry(node, "challenge-types") {
        None => default_challenge_types(),
        Some(names) => names
            .iter()
            .map(|name| name.parse::<ChallengeType>())
            .collect::<Result<Vec<_>, _>>()?,
    };

    let config = ValidationConfig {
        workers: get_uint_entry(node, "workers")?.unwrap_or_else(default_workers),
        max_retries: get_uint_entry(node, "max-retries")?.unwrap_or_else(default_max_retries),
        retry_backoff_secs: get_uint_entry(node, "retry-backoff-secs")?
            .unwrap_or_else(default_retry_backoff),
        attempt_timeout_secs: get_uint_entry(node, "attempt-timeout-secs")?
            .unwrap_or_else(default_attempt_timeout),
        authorization_lifetime_days: get_uint_entry(node, "authorization-lifetime-days")?
            .unwrap_or_else(default_authorization_lifetime),
        on_exhaustion,
        challenge_types,
    };

    trace!(
        workers = config.workers,
        max_retries = config.max_retries,
        retry_backoff_secs = config.retry_backoff_secs,
        challenge_types = ?config.challenge_types,
        "Parsed validation configuration"
    );

    Ok(config)
}

/// Parse HTTP-01 validator block
pub fn parse_http01_config(node: &kdl::KdlNode) -> Result<Http01Config> {
    Ok(Http01Config {
        port: get_uint_entry(node, "port")?.unwrap_or_else(default_http01_port),
        timeout_secs: get_uint_entry(node, "timeout-secs")?.unwrap_or_else(default_http01_timeout),
        max_redirects: get_uint_entry(node, "max-redirects")?.unwrap_or_else(default_max_redirects),
        max_redirect_url_len: get_uint_entry(node, "max-redirect-url-len")?
            .unwrap_or_else(default_max_redirect_url_len),
        max_body_bytes: get_uint_entry(node, "max-body-bytes")?
            .unwrap_or_else(default_max_body_bytes),
    })
}

/// Parse DNS-01 validator block
pub fn parse_dns01_config(node: &kdl::KdlNode) -> Result<Dns01Config> {
    let nameservers = get_string_list_entry(node, "nameservers")
        .unwrap_or_default()
        .iter()
        .map(|s| {
            s.parse::<IpAddr>()
                .with_context(|| format!("Invalid dns-01 nameserver address '{}'", s))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Dns01Config {
        nameservers,
        timeout_secs: get_uint_entry(node, "timeout-secs")?.unwrap_or_else(default_dns01_timeout),
    })
}
