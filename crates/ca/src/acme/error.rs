//! ACME protocol errors and their RFC 8555 problem documents

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// URN namespace for ACME error types (RFC 8555 §6.7)
pub const ACME_ERROR_NS: &str = "urn:ietf:params:acme:error:";

/// Errors returned from request handlers
///
/// Every variant maps onto one ACME error type; see [`AcmeError::problem`].
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Bad or missing fields, bad request structure
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Unknown, expired or already used nonce
    #[error("Invalid anti-replay nonce")]
    BadNonce,

    /// Signer not permitted, inactive account, or another account's resource
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Lookup-only request for an account that does not exist
    #[error("No account exists for the provided key")]
    AccountDoesNotExist,

    #[error("Certificate has already been revoked")]
    AlreadyRevoked,

    #[error("Unsupported identifier: {0}")]
    UnsupportedIdentifier(String),

    /// Identifier refused by CA policy
    #[error("Identifier rejected by policy: {0}")]
    RejectedIdentifier(String),

    #[error("Order is not ready for finalization (status: {0})")]
    OrderNotReady(String),

    #[error("Bad CSR: {0}")]
    BadCsr(String),

    #[error("External account binding is required")]
    ExternalAccountRequired,

    /// The client must act out of band, e.g. agree to the terms of service
    #[error("User action required: {0}")]
    UserActionRequired(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Configuration or collaborator failures
    #[error("Internal server error: {0}")]
    ServerInternal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AcmeError {
    /// ACME error type suffix (appended to [`ACME_ERROR_NS`])
    pub fn kind(&self) -> &'static str {
        match self {
            AcmeError::Malformed(_) | AcmeError::NotFound(_) => "malformed",
            AcmeError::BadNonce => "badNonce",
            AcmeError::Unauthorized(_) => "unauthorized",
            AcmeError::AccountDoesNotExist => "accountDoesNotExist",
            AcmeError::AlreadyRevoked => "alreadyRevoked",
            AcmeError::UnsupportedIdentifier(_) => "unsupportedIdentifier",
            AcmeError::RejectedIdentifier(_) => "rejectedIdentifier",
            AcmeError::OrderNotReady(_) => "orderNotReady",
            AcmeError::BadCsr(_) => "badCSR",
            AcmeError::ExternalAccountRequired => "externalAccountRequired",
            AcmeError::UserActionRequired(_) => "userActionRequired",
            AcmeError::ServerInternal(_) | AcmeError::Storage(_) => "serverInternal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AcmeError::Unauthorized(_)
            | AcmeError::OrderNotReady(_)
            | AcmeError::UserActionRequired(_) => StatusCode::FORBIDDEN,
            AcmeError::NotFound(_) => StatusCode::NOT_FOUND,
            AcmeError::ServerInternal(_) | AcmeError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Translate into the problem document returned to the client.
    ///
    /// Storage details are not exposed.
    pub fn problem(&self) -> Problem {
        let detail = match self {
            AcmeError::Storage(_) => "internal storage failure".to_string(),
            other => other.to_string(),
        };
        Problem::new(self.kind(), detail, self.status())
    }
}

/// RFC 7807 problem document with an ACME error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    pub status: u16,
}

impl Problem {
    pub fn new(kind: &str, detail: impl Into<String>, status: StatusCode) -> Self {
        Self {
            problem_type: format!("{}{}", ACME_ERROR_NS, kind),
            detail: detail.into(),
            status: status.as_u16(),
        }
    }

    /// Error type without the URN namespace
    pub fn kind(&self) -> &str {
        self.problem_type
            .strip_prefix(ACME_ERROR_NS)
            .unwrap_or(&self.problem_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_mapping() {
        let problem = AcmeError::BadNonce.problem();
        assert_eq!(problem.problem_type, "urn:ietf:params:acme:error:badNonce");
        assert_eq!(problem.status, 400);
        assert_eq!(problem.kind(), "badNonce");

        let problem = AcmeError::Unauthorized("account is deactivated".into()).problem();
        assert_eq!(problem.kind(), "unauthorized");
        assert_eq!(problem.status, 403);
        assert!(problem.detail.contains("deactivated"));

        assert_eq!(AcmeError::NotFound("order".into()).problem().status, 404);
        assert_eq!(AcmeError::BadCsr("x".into()).kind(), "badCSR");
    }

    #[test]
    fn test_storage_detail_is_hidden() {
        let err = AcmeError::from(StorageError::Backend("disk on fire at /var/lib".into()));
        let problem = err.problem();
        assert_eq!(problem.kind(), "serverInternal");
        assert_eq!(problem.status, 500);
        assert!(!problem.detail.contains("/var/lib"));
    }

    #[test]
    fn test_problem_serializes_type_field() {
        let json = serde_json::to_value(AcmeError::AlreadyRevoked.problem()).unwrap();
        assert_eq!(json["type"], "urn:ietf:params:acme:error:alreadyRevoked");
        assert_eq!(json["status"], 400);
    }
}
