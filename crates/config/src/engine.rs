//! Challenge validation engine configuration.
//!
//! Covers the worker pool, retry policy and the per-challenge-type network
//! limits used by the HTTP-01 and DNS-01 validators.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use validator::Validate;

use sentinel_ca_common::ChallengeType;

// ============================================================================
// Validation Engine
// ============================================================================

/// What happens to an authorization once its validation retries run out
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Mark the challenge and authorization `invalid`
    #[default]
    Invalidate,
    /// Drop the task and leave statuses untouched; the client may re-accept
    Stall,
}

/// Validation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValidationConfig {
    /// Maximum number of concurrent validation workers
    #[serde(default = "default_workers")]
    #[validate(range(min = 1, max = 64, message = "validation workers must be 1..=64"))]
    pub workers: usize,

    /// Retries after the first failed attempt before giving up
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 100, message = "validation max-retries must be <= 100"))]
    pub max_retries: u32,

    /// Linear backoff step; the k-th retry waits `k * step`
    #[serde(default = "default_retry_backoff")]
    #[validate(range(
        min = 1,
        max = 3600,
        message = "validation retry-backoff-secs must be 1..=3600"
    ))]
    pub retry_backoff_secs: u64,

    /// Upper bound for a single validation attempt
    #[serde(default = "default_attempt_timeout")]
    #[validate(range(
        min = 1,
        max = 600,
        message = "validation attempt-timeout-secs must be 1..=600"
    ))]
    pub attempt_timeout_secs: u64,

    /// How long a `valid` authorization remains usable
    #[serde(default = "default_authorization_lifetime")]
    #[validate(range(min = 1, max = 365, message = "authorization-lifetime-days must be 1..=365"))]
    pub authorization_lifetime_days: u32,

    #[serde(default)]
    pub on_exhaustion: ExhaustionPolicy,

    /// Challenge types offered for each new authorization
    #[serde(default = "default_challenge_types")]
    #[validate(length(min = 1, message = "at least one challenge type must be offered"))]
    pub challenge_types: Vec<ChallengeType>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
            attempt_timeout_secs: default_attempt_timeout(),
            authorization_lifetime_days: default_authorization_lifetime(),
            on_exhaustion: ExhaustionPolicy::default(),
            challenge_types: default_challenge_types(),
        }
    }
}

impl ValidationConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn authorization_lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.authorization_lifetime_days) * 86400)
    }
}

pub(crate) fn default_workers() -> usize {
    5
}

pub(crate) fn default_max_retries() -> u32 {
    5
}

pub(crate) fn default_retry_backoff() -> u64 {
    5
}

pub(crate) fn default_attempt_timeout() -> u64 {
    60
}

pub(crate) fn default_authorization_lifetime() -> u32 {
    15
}

pub(crate) fn default_challenge_types() -> Vec<ChallengeType> {
    vec![ChallengeType::Http01]
}

// ============================================================================
// HTTP-01
// ============================================================================

/// HTTP-01 validator limits
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Http01Config {
    /// Port the challenge URL is fetched from
    #[serde(default = "default_http01_port")]
    #[validate(range(min = 1, message = "http-01 port must be non-zero"))]
    pub port: u16,

    /// Connect and response timeout
    #[serde(default = "default_http01_timeout")]
    #[validate(range(min = 1, max = 300, message = "http-01 timeout-secs must be 1..=300"))]
    pub timeout_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_max_redirect_url_len")]
    pub max_redirect_url_len: usize,

    #[serde(default = "default_max_body_bytes")]
    #[validate(range(min = 1, max = 65536, message = "http-01 max-body-bytes must be 1..=65536"))]
    pub max_body_bytes: usize,
}

impl Default for Http01Config {
    fn default() -> Self {
        Self {
            port: default_http01_port(),
            timeout_secs: default_http01_timeout(),
            max_redirects: default_max_redirects(),
            max_redirect_url_len: default_max_redirect_url_len(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Http01Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub(crate) fn default_http01_port() -> u16 {
    80
}

pub(crate) fn default_http01_timeout() -> u64 {
    10
}

pub(crate) fn default_max_redirects() -> usize {
    10
}

pub(crate) fn default_max_redirect_url_len() -> usize {
    2000
}

pub(crate) fn default_max_body_bytes() -> usize {
    512
}

// ============================================================================
// DNS-01
// ============================================================================

/// DNS-01 validator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Dns01Config {
    /// Recursive resolvers to query (empty = the resolver's public defaults)
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,

    /// Per-query timeout
    #[serde(default = "default_dns01_timeout")]
    #[validate(range(min = 1, max = 300, message = "dns-01 timeout-secs must be 1..=300"))]
    pub timeout_secs: u64,
}

impl Default for Dns01Config {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            timeout_secs: default_dns01_timeout(),
        }
    }
}

impl Dns01Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub(crate) fn default_dns01_timeout() -> u64 {
    10
}
