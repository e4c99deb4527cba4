//! Common types for the Sentinel ACME certificate authority
//!
//! This crate holds the small, dependency-light types shared across the
//! workspace: resource identifier newtypes and the identifier / challenge
//! value types that both the configuration layer and the engine speak.

pub mod ids;
pub mod types;

pub use ids::{AccountId, AuthorizationId, CertificateSerial, OrderId};
pub use types::{
    ChallengeType, Identifier, IdentifierError, IdentifierType, UnknownChallengeType,
    WILDCARD_PREFIX,
};
