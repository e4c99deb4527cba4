//! Type-safe identifier newtypes for ACME resources.
//!
//! These types provide compile-time safety for resource identifiers,
//! preventing accidental mixing of different ID types (e.g., passing an
//! `OrderId` where an `AuthorizationId` is expected). All of them are
//! opaque strings on the wire and in storage keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// ACME account identifier.
///
/// The account id doubles as the JWS key id (`kid`) clients use once the
/// account exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create a new random account ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Create a new random order ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Authorization identifier.
///
/// Challenges are addressed by their authorization id plus challenge type,
/// so there is no separate challenge identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationId(String);

impl AuthorizationId {
    /// Create a new random authorization ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AuthorizationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Certificate serial number.
///
/// Stored as lowercase colon-free hex, which keeps it usable as a storage
/// key segment regardless of how the issuer formats serials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateSerial(String);

impl CertificateSerial {
    /// Normalize a serial given as hex, with or without `:` separators
    pub fn from_hex(hex: &str) -> Self {
        Self(
            hex.chars()
                .filter(|c| *c != ':')
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        )
    }

    /// Build a serial from its big-endian byte representation
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{:02x}", b));
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CertificateSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id() {
        let id1 = AccountId::generate();
        let id2 = AccountId::new("test-id");

        assert_ne!(id1, id2);
        assert_eq!(id2.as_str(), "test-id");
        assert_eq!(id2.to_string(), "test-id");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(OrderId::generate(), OrderId::generate());
        assert_ne!(AuthorizationId::generate(), AuthorizationId::generate());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = AuthorizationId::new("authz-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"authz-1\"");
    }

    #[test]
    fn test_serial_normalization() {
        assert_eq!(CertificateSerial::from_hex("0A:1b:FF").as_str(), "0a1bff");
        assert_eq!(
            CertificateSerial::from_bytes(&[0x0a, 0x1b, 0xff]),
            CertificateSerial::from_hex("0a1bff")
        );
    }
}
