//! Configuration validation
//!
//! Semantic checks that go beyond the structural `validator` ranges, plus
//! linting that produces warnings only.

pub mod lint;

use std::collections::HashSet;
use std::fmt;

use crate::Config;

/// Validation error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Schema/range error
    Schema,
    /// Configuration logic error
    Logic,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Schema => write!(f, "Schema"),
            ErrorCategory::Logic => write!(f, "Logic"),
        }
    }
}

/// Validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Validation warning
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Validation result containing errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Create a new empty validation result
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Add a warning
    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Merge another validation result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Check if validation passed (no errors)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Check if there are any warnings
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Semantic checks that cannot be expressed as field ranges
pub fn validate_semantics(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    match url::Url::parse(&config.server.base_url) {
        Ok(url) if url.scheme() == "https" || url.scheme() == "http" => {}
        Ok(url) => result.add_error(ValidationError::new(
            ErrorCategory::Logic,
            format!("server base-url must use http or https, got '{}'", url.scheme()),
        )),
        Err(e) => result.add_error(ValidationError::new(
            ErrorCategory::Logic,
            format!("server base-url '{}' is not a valid URL: {}", config.server.base_url, e),
        )),
    }

    let mut seen = HashSet::new();
    for ty in &config.validation.challenge_types {
        if !seen.insert(*ty) {
            result.add_warning(ValidationWarning::new(format!(
                "challenge type '{}' is listed more than once",
                ty
            )));
        }
    }

    if config.tidy.enabled && config.tidy.account_delete_grace_days == 0 {
        result.add_warning(ValidationWarning::new(
            "tidy account-delete-grace-days is 0; revoked accounts are deleted on the next sweep",
        ));
    }

    if config.storage.backend == crate::StorageBackend::File
        && config.storage.path.as_os_str().is_empty()
    {
        result.add_error(ValidationError::new(
            ErrorCategory::Logic,
            "storage path must be set for the file backend",
        ));
    }

    result
}
