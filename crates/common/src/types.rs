//! Value types shared by the configuration layer and the ACME engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Prefix marking a wildcard DNS identifier
pub const WILDCARD_PREFIX: &str = "*.";

// ============================================================================
// Identifiers
// ============================================================================

/// Kind of identifier a certificate can be requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
    Ip,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Dns => "dns",
            IdentifierType::Ip => "ip",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identifier (RFC 8555 §7.1.3 / RFC 8738). Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

/// Reasons an identifier is rejected before policy evaluation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier value is empty")]
    Empty,

    #[error("invalid DNS name '{0}'")]
    InvalidDnsName(String),

    #[error("invalid IP address '{0}'")]
    InvalidIp(String),

    #[error("wildcard is only allowed as the leftmost label: '{0}'")]
    InvalidWildcard(String),
}

impl Identifier {
    /// Create a DNS identifier
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Dns,
            value: value.into(),
        }
    }

    /// Create an IP identifier
    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Ip,
            value: value.into(),
        }
    }

    /// Whether this is a `*.` DNS identifier
    pub fn is_wildcard(&self) -> bool {
        self.kind == IdentifierType::Dns && self.value.starts_with(WILDCARD_PREFIX)
    }

    /// The identifier with any wildcard label removed.
    ///
    /// Authorizations for `*.example.com` are issued against `example.com`.
    pub fn base(&self) -> Identifier {
        match self.value.strip_prefix(WILDCARD_PREFIX) {
            Some(base) if self.kind == IdentifierType::Dns => Identifier::dns(base),
            _ => self.clone(),
        }
    }

    /// Normalize and syntactically check the identifier.
    ///
    /// DNS names are lowercased and stripped of a trailing dot; IP
    /// addresses are re-rendered in canonical form.
    pub fn normalized(&self) -> Result<Identifier, IdentifierError> {
        let value = self.value.trim();
        if value.is_empty() {
            return Err(IdentifierError::Empty);
        }

        match self.kind {
            IdentifierType::Ip => {
                let ip = IpAddr::from_str(value)
                    .map_err(|_| IdentifierError::InvalidIp(value.to_string()))?;
                Ok(Identifier::ip(ip.to_string()))
            }
            IdentifierType::Dns => {
                let lowered = value.trim_end_matches('.').to_ascii_lowercase();
                let (wildcard, name) = match lowered.strip_prefix(WILDCARD_PREFIX) {
                    Some(rest) => (true, rest),
                    None => (false, lowered.as_str()),
                };

                if name.contains('*') {
                    return Err(IdentifierError::InvalidWildcard(value.to_string()));
                }
                if name.is_empty() || name.len() > 253 {
                    return Err(IdentifierError::InvalidDnsName(value.to_string()));
                }
                for label in name.split('.') {
                    let valid = !label.is_empty()
                        && label.len() <= 63
                        && !label.starts_with('-')
                        && !label.ends_with('-')
                        && label
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
                    if !valid {
                        return Err(IdentifierError::InvalidDnsName(value.to_string()));
                    }
                }

                if wildcard {
                    Ok(Identifier::dns(format!("{}{}", WILDCARD_PREFIX, name)))
                } else {
                    Ok(Identifier::dns(name))
                }
            }
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

// ============================================================================
// Challenge Types
// ============================================================================

/// Challenge mechanisms for proving control of an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// Unknown challenge type name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown challenge type '{0}'. Valid types: http-01, dns-01, tls-alpn-01")]
pub struct UnknownChallengeType(pub String);

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = UnknownChallengeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http-01" => Ok(ChallengeType::Http01),
            "dns-01" => Ok(ChallengeType::Dns01),
            "tls-alpn-01" => Ok(ChallengeType::TlsAlpn01),
            other => Err(UnknownChallengeType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identifier_serde_shape() {
        let json = serde_json::to_value(Identifier::dns("example.com")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "dns", "value": "example.com"}));

        let parsed: Identifier =
            serde_json::from_str(r#"{"type":"ip","value":"192.0.2.1"}"#).unwrap();
        assert_eq!(parsed, Identifier::ip("192.0.2.1"));
    }

    #[test]
    fn test_wildcard_base() {
        let id = Identifier::dns("*.example.com");
        assert!(id.is_wildcard());
        assert_eq!(id.base(), Identifier::dns("example.com"));
        assert!(!Identifier::dns("example.com").is_wildcard());
    }

    #[test]
    fn test_normalize_dns() {
        assert_eq!(
            Identifier::dns("WWW.Example.COM.").normalized().unwrap(),
            Identifier::dns("www.example.com")
        );
        assert_eq!(
            Identifier::dns("*.Example.com").normalized().unwrap(),
            Identifier::dns("*.example.com")
        );
        assert!(Identifier::dns("a.*.example.com").normalized().is_err());
        assert!(Identifier::dns("-bad.example.com").normalized().is_err());
        assert!(Identifier::dns("bad..example.com").normalized().is_err());
        assert_eq!(Identifier::dns("  ").normalized(), Err(IdentifierError::Empty));
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(
            Identifier::ip("2001:DB8::1").normalized().unwrap(),
            Identifier::ip("2001:db8::1")
        );
        assert!(Identifier::ip("999.1.1.1").normalized().is_err());
    }

    #[test]
    fn test_challenge_type_names() {
        for ty in [ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01] {
            assert_eq!(ty.as_str().parse::<ChallengeType>().unwrap(), ty);
            assert_eq!(
                serde_json::to_string(&ty).unwrap(),
                format!("\"{}\"", ty.as_str())
            );
        }
        assert!("http-02".parse::<ChallengeType>().is_err());
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(label in "[a-z0-9]{1,20}", tld in "[a-z]{2,6}") {
            let id = Identifier::dns(format!("{}.{}", label, tld));
            let once = id.normalized().unwrap();
            prop_assert_eq!(once.normalized().unwrap(), once);
        }
    }
}
