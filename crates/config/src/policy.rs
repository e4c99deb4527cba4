//! Order, account and tidy policy configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

// ============================================================================
// Orders
// ============================================================================

/// Order lifetime and certificate validity policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderConfig {
    /// How long a new order (and its pending authorizations) stays open
    #[serde(default = "default_order_lifetime")]
    #[validate(range(min = 1, max = 720, message = "orders lifetime-hours must be 1..=720"))]
    pub lifetime_hours: u64,

    /// Default `notAfter - notBefore` when the client requests no window
    #[serde(default = "default_certificate_lifetime")]
    #[validate(range(min = 1, max = 825, message = "certificate-lifetime-days must be 1..=825"))]
    pub certificate_lifetime_days: u32,

    /// Maximum identifiers in one order
    #[serde(default = "default_max_identifiers")]
    #[validate(range(min = 1, max = 1000, message = "orders max-identifiers must be 1..=1000"))]
    pub max_identifiers: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            lifetime_hours: default_order_lifetime(),
            certificate_lifetime_days: default_certificate_lifetime(),
            max_identifiers: default_max_identifiers(),
        }
    }
}

impl OrderConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_hours.saturating_mul(3600))
    }

    pub fn certificate_lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.certificate_lifetime_days) * 86400)
    }
}

pub(crate) fn default_order_lifetime() -> u64 {
    24
}

pub(crate) fn default_certificate_lifetime() -> u32 {
    90
}

pub(crate) fn default_max_identifiers() -> usize {
    100
}

// ============================================================================
// Accounts
// ============================================================================

/// When new-account requests must carry an external account binding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EabPolicyMode {
    /// Bindings are ignored
    #[default]
    NotRequired,
    /// Bindings are verified when present
    Optional,
    /// Every new account must present a valid binding
    NewAccountRequired,
}

impl EabPolicyMode {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "not-required" | "none" => Some(Self::NotRequired),
            "optional" => Some(Self::Optional),
            "new-account-required" | "required" => Some(Self::NewAccountRequired),
            _ => None,
        }
    }

    /// Whether the directory advertises `externalAccountRequired`
    pub fn is_required(&self) -> bool {
        matches!(self, Self::NewAccountRequired)
    }
}

/// Account policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    #[serde(default)]
    pub eab_policy: EabPolicyMode,

    /// Reject new accounts that have not agreed to the terms of service
    #[serde(default)]
    pub require_tos: bool,

    /// Advertised in the directory `meta` object
    #[serde(default)]
    pub terms_of_service: Option<String>,

    #[serde(default)]
    pub website: Option<String>,
}

// ============================================================================
// Tidy
// ============================================================================

/// Periodic cleanup of expired and abandoned ACME state
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TidyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tidy_interval")]
    #[validate(range(min = 60, max = 604_800, message = "tidy interval-secs must be 60..=604800"))]
    pub interval_secs: u64,

    /// Valid accounts unused for this long are revoked
    #[serde(default = "default_account_revoke_after")]
    #[validate(range(
        min = 1,
        max = 3650,
        message = "tidy account-revoke-after-days must be 1..=3650"
    ))]
    pub account_revoke_after_days: u32,

    /// Revoked or deactivated accounts are deleted this long after revocation
    #[serde(default = "default_account_delete_grace")]
    #[validate(range(max = 3650, message = "tidy account-delete-grace-days must be <= 3650"))]
    pub account_delete_grace_days: u32,

    /// Expired orders and authorizations are kept this long before deletion
    #[serde(default = "default_buffer_hours")]
    #[validate(range(max = 8760, message = "tidy buffer-hours must be <= 8760"))]
    pub buffer_hours: u64,
}

impl Default for TidyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_tidy_interval(),
            account_revoke_after_days: default_account_revoke_after(),
            account_delete_grace_days: default_account_delete_grace(),
            buffer_hours: default_buffer_hours(),
        }
    }
}

impl TidyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn account_revoke_after(&self) -> Duration {
        Duration::from_secs(u64::from(self.account_revoke_after_days) * 86400)
    }

    pub fn account_delete_grace(&self) -> Duration {
        Duration::from_secs(u64::from(self.account_delete_grace_days) * 86400)
    }

    pub fn buffer(&self) -> Duration {
        Duration::from_secs(self.buffer_hours.saturating_mul(3600))
    }
}

fn default_true() -> bool {
    true
}

pub(crate) fn default_tidy_interval() -> u64 {
    3600
}

pub(crate) fn default_account_revoke_after() -> u32 {
    90
}

pub(crate) fn default_account_delete_grace() -> u32 {
    30
}

pub(crate) fn default_buffer_hours() -> u64 {
    24
}
