//! KDL configuration parsing.
//!
//! This module contains all functions for parsing KDL configuration files
//! into Sentinel CA configuration structures. It is organized into submodules:
//!
//! - `helpers`: Common parsing utility functions
//! - `server`: Server, storage and nonce parsing
//! - `engine`: Validation engine, HTTP-01 and DNS-01 parsing
//! - `policy`: Orders, accounts and tidy parsing

mod engine;
mod helpers;
mod policy;
mod server;

pub use helpers::offset_to_line_col;

use anyhow::Result;

use crate::Config;

use engine::{parse_dns01_config, parse_http01_config, parse_validation_config};
use policy::{parse_account_config, parse_order_config, parse_tidy_config};
use server::{parse_nonce_config, parse_server_config, parse_storage_config};

// ============================================================================
// Top-Level Document Parser
// ============================================================================

/// Convert a parsed KDL document to Config
pub fn parse_kdl_document(doc: kdl::KdlDocument) -> Result<Config> {
    let mut server = None;
    let mut storage = None;
    let mut nonce = None;
    let mut validation = None;
    let mut http01 = None;
    let mut dns01 = None;
    let mut orders = None;
    let mut accounts = None;
    let mut tidy = None;

    for node in doc.nodes() {
        match node.name().value() {
            "server" => server = Some(parse_server_config(node)?),
            "storage" => storage = Some(parse_storage_config(node)?),
            "nonce" => nonce = Some(parse_nonce_config(node)?),
            "validation" => validation = Some(parse_validation_config(node)?),
            "http-01" => http01 = Some(parse_http01_config(node)?),
            "dns-01" => dns01 = Some(parse_dns01_config(node)?),
            "orders" => orders = Some(parse_order_config(node)?),
            "accounts" => accounts = Some(parse_account_config(node)?),
            "tidy" => tidy = Some(parse_tidy_config(node)?),
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level configuration block: '{}'\n\
                     Valid blocks are: server, storage, nonce, validation, http-01, dns-01, orders, accounts, tidy",
                    other
                ));
            }
        }
    }

    let server = server.ok_or_else(|| {
        anyhow::anyhow!(
            "Missing required 'server' configuration block\n\
             Example:\n\
             server {{\n\
                 base-url \"https://ca.example.com/acme\"\n\
             }}"
        )
    })?;

    Ok(Config {
        server,
        storage: storage.unwrap_or_default(),
        nonce: nonce.unwrap_or_default(),
        validation: validation.unwrap_or_default(),
        http01: http01.unwrap_or_default(),
        dns01: dns01.unwrap_or_default(),
        orders: orders.unwrap_or_default(),
        accounts: accounts.unwrap_or_default(),
        tidy: tidy.unwrap_or_default(),
    })
}
