//! Order, account and tidy KDL parsing.

use anyhow::Result;

use crate::policy::*;

use super::helpers::{get_bool_entry, get_string_entry, get_uint_entry};

/// Parse orders block
pub fn parse_order_config(node: &kdl::KdlNode) -> Result<OrderConfig> {
    Ok(OrderConfig {
        lifetime_hours: get_uint_entry(node, "lifetime-hours")?
            .unwrap_or_else(default_order_lifetime),
        certificate_lifetime_days: get_uint_entry(node, "certificate-lifetime-days")?
            .unwrap_or_else(default_certificate_lifetime),
        max_identifiers: get_uint_entry(node, "max-identifiers")?
            .unwrap_or_else(default_max_identifiers),
    })
}

/// Parse accounts block
pub fn parse_account_config(node: &kdl::KdlNode) -> Result<AccountConfig> {
    let eab_policy = match get_string_entry(node, "eab-policy") {
        None => EabPolicyMode::default(),
        Some(s) => EabPolicyMode::from_str_loose(&s).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid eab-policy '{}'. Valid policies: not-required, optional, new-account-required",
                s
            )
        })?,
    };

    Ok(AccountConfig {
        eab_policy,
        require_tos: get_bool_entry(node, "require-tos").unwrap_or(false),
        terms_of_service: get_string_entry(node, "terms-of-service"),
        website: get_string_entry(node, "website"),
    })
}

/// Parse tidy block
pub fn parse_tidy_config(node: &kdl::KdlNode) -> Result<TidyConfig> {
    Ok(TidyConfig {
        enabled: get_bool_entry(node, "enabled").unwrap_or(true),
        interval_secs: get_uint_entry(node, "interval-secs")?.unwrap_or_else(default_tidy_interval),
        account_revoke_after_days: get_uint_entry(node, "account-revoke-after-days")?
            .unwrap_or_else(default_account_revoke_after),
        account_delete_grace_days: get_uint_entry(node, "account-delete-grace-days")?
            .unwrap_or_else(default_account_delete_grace),
        buffer_hours: get_uint_entry(node, "buffer-hours")?.unwrap_or_else(default_buffer_hours),
    })
}
