//! Configuration for the Sentinel ACME certificate authority
//!
//! Parses KDL (or JSON) configuration into typed sections, applies
//! structural range checks via `validator`, semantic checks and lints.
//!
//! # Module Organization
//!
//! - [`server`]: Base URL, storage backend and nonce lifetime
//! - [`engine`]: Validation engine, HTTP-01 and DNS-01 limits
//! - [`policy`]: Orders, accounts and tidy policy
//! - [`validate`]: Semantic validation and linting
//! - `kdl`: KDL format parsing
//! - `defaults`: Default embedded configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

// ============================================================================
// Module Declarations
// ============================================================================

mod defaults;
pub mod engine;
mod kdl;
pub mod policy;
pub mod server;
pub mod validate;

// ============================================================================
// Re-exports
// ============================================================================

pub use defaults::{create_default_config, DEFAULT_CONFIG_KDL};
pub use engine::{Dns01Config, ExhaustionPolicy, Http01Config, ValidationConfig};
pub use policy::{AccountConfig, EabPolicyMode, OrderConfig, TidyConfig};
pub use server::{NonceConfig, ServerConfig, StorageBackend, StorageConfig};
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

// ============================================================================
// Main Configuration Structure
// ============================================================================

/// Complete CA configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[validate(nested)]
    pub nonce: NonceConfig,

    #[serde(default)]
    #[validate(nested)]
    pub validation: ValidationConfig,

    #[serde(default)]
    #[validate(nested)]
    pub http01: Http01Config,

    #[serde(default)]
    pub dns01: Dns01Config,

    #[serde(default)]
    #[validate(nested)]
    pub orders: OrderConfig,

    #[serde(default)]
    pub accounts: AccountConfig,

    #[serde(default)]
    #[validate(nested)]
    pub tidy: TidyConfig,
}

// ============================================================================
// Config Implementation
// ============================================================================

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        match extension {
            "kdl" => Self::from_kdl(&content),
            "json" => Self::from_json(&content),
            _ => Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        }
    }

    /// Load the default embedded configuration.
    ///
    /// Falls back to the programmatic default if the embedded KDL fails
    /// to parse.
    pub fn default_embedded() -> Result<Self> {
        Self::from_kdl(DEFAULT_CONFIG_KDL).or_else(|e| {
            tracing::warn!(
                "Failed to parse embedded KDL config, using programmatic default: {}",
                e
            );
            Ok(create_default_config())
        })
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
            use miette::Diagnostic;

            let mut error_msg = String::new();
            error_msg.push_str("KDL configuration parse error:\n\n");

            let mut found_details = false;
            if let Some(related) = e.related() {
                for diagnostic in related {
                    error_msg.push_str(&format!("  {}\n", diagnostic));
                    found_details = true;

                    if let Some(labels) = diagnostic.labels() {
                        for label in labels {
                            let (line, col) = kdl::offset_to_line_col(content, label.offset());
                            error_msg
                                .push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                            let lines: Vec<&str> = content.lines().collect();
                            if let Some(line_content) = lines.get(line.saturating_sub(1)) {
                                error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                                error_msg.push_str(&format!(
                                    "     | {}^",
                                    " ".repeat(col.saturating_sub(1))
                                ));
                                if let Some(label_msg) = label.label() {
                                    error_msg.push_str(&format!(" {}", label_msg));
                                }
                                error_msg.push('\n');
                            }
                        }
                    }

                    if let Some(help) = diagnostic.help() {
                        error_msg.push_str(&format!("\n  Help: {}\n", help));
                    }
                }
            }

            if !found_details {
                error_msg.push_str(&format!("  {}\n", e));
                error_msg.push_str("\n  Note: Check your KDL syntax. Common issues:\n");
                error_msg.push_str("    - Unclosed strings (missing closing quote)\n");
                error_msg.push_str("    - Unclosed blocks (missing closing brace)\n");
                error_msg.push_str("    - Booleans are written #true / #false\n");
            }

            anyhow::anyhow!("{}", error_msg)
        })?;

        kdl::parse_kdl_document(doc)
    }

    /// Parse configuration from JSON format
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON configuration")
    }

    /// Validate the configuration.
    ///
    /// Range violations and semantic errors end up in
    /// [`ValidationResult::errors`]; lints only add warnings.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = Validate::validate(self) {
            result.add_error(ValidationError::new(
                ErrorCategory::Schema,
                format!("Configuration validation failed: {}", e),
            ));
        }

        result.merge(validate::validate_semantics(self));
        result.merge(validate::lint::lint_config(self));
        result
    }

    /// Validate and turn any error into an `anyhow` failure
    pub fn validated(self) -> Result<Self> {
        let result = self.validate();
        for warning in &result.warnings {
            tracing::warn!(warning = %warning, "Configuration lint");
        }
        if !result.is_valid() {
            let messages: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
            return Err(anyhow::anyhow!(
                "Invalid configuration:\n  {}",
                messages.join("\n  ")
            ));
        }
        Ok(self)
    }
}
