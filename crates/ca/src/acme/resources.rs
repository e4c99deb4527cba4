//! ACME resources and their state machines
//!
//! Accounts, orders, authorizations and challenges as they are persisted,
//! plus the engine-internal validation task. Status transitions live here
//! as methods so that handlers, the engine and tidy apply the same rules.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use sentinel_ca_common::{
    AccountId, AuthorizationId, CertificateSerial, ChallengeType, Identifier, OrderId,
};

use super::error::Problem;

/// Random bytes in a challenge token (RFC 8555 §8.1 requires >= 128 bits)
const TOKEN_BYTES: usize = 32;

/// Generate a challenge token: base64url without padding
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Serde adapter storing byte fields as base64url strings
mod b64 {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

macro_rules! status_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(serde_json::Value::String(s)) => f.write_str(&s),
                    _ => write!(f, "{:?}", self),
                }
            }
        }
    };
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

status_display!(AccountStatus);

/// A registered ACME account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Doubles as the JWS `kid`
    pub id: AccountId,
    pub status: AccountStatus,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    /// Key thumbprint (RFC 7638) of the account key
    pub key_thumbprint: String,
    /// DER SubjectPublicKeyInfo of the account key
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    /// Key id of the external account binding used at creation
    #[serde(default)]
    pub external_account_binding: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    /// Latest `notAfter` of any certificate issued to this account
    #[serde(default)]
    pub max_issued_cert_expiry: Option<DateTime<Utc>>,
    /// Set on deactivation or revocation; starts the deletion grace period
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_valid(&self) -> bool {
        self.status == AccountStatus::Valid
    }

    /// Client-requested deactivation (RFC 8555 §7.3.6)
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.status = AccountStatus::Deactivated;
        self.revoked_at = Some(now);
    }

    /// Server-initiated revocation after inactivity
    pub fn revoke(&mut self, now: DateTime<Utc>) {
        self.status = AccountStatus::Revoked;
        self.revoked_at = Some(now);
    }

    /// Record an issued certificate's expiry
    pub fn note_issued(&mut self, not_after: DateTime<Utc>) {
        if self.max_issued_cert_expiry.map_or(true, |max| not_after > max) {
            self.max_issued_cert_expiry = Some(not_after);
        }
    }
}

// ============================================================================
// Challenges
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

status_display!(ChallengeStatus);

/// One method of proving control of an authorization's identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<Problem>,
}

impl Challenge {
    pub fn new(challenge_type: ChallengeType) -> Self {
        Self {
            challenge_type,
            token: generate_token(),
            status: ChallengeStatus::Pending,
            validated_at: None,
            error: None,
        }
    }
}

// ============================================================================
// Authorizations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

status_display!(AuthorizationStatus);

impl AuthorizationStatus {
    /// Statuses that make the owning order unusable
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::Deactivated | Self::Expired | Self::Revoked
        )
    }
}

/// Proof-of-control record for one identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub id: AuthorizationId,
    pub account_id: AccountId,
    /// Base identifier; for wildcards the `*.` label is stripped
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    pub fn challenge(&self, challenge_type: ChallengeType) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == challenge_type)
    }

    pub fn challenge_mut(&mut self, challenge_type: ChallengeType) -> Option<&mut Challenge> {
        self.challenges
            .iter_mut()
            .find(|c| c.challenge_type == challenge_type)
    }

    /// Mark the challenge valid and the authorization valid until `expires`
    pub fn mark_valid(
        &mut self,
        challenge_type: ChallengeType,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) {
        if let Some(challenge) = self.challenge_mut(challenge_type) {
            challenge.status = ChallengeStatus::Valid;
            challenge.validated_at = Some(now);
            challenge.error = None;
        }
        self.status = AuthorizationStatus::Valid;
        self.expires = expires;
    }

    /// Mark the challenge and the authorization invalid
    pub fn mark_invalid(&mut self, challenge_type: ChallengeType, error: Problem) {
        if let Some(challenge) = self.challenge_mut(challenge_type) {
            challenge.status = ChallengeStatus::Invalid;
            challenge.error = Some(error);
        }
        self.status = AuthorizationStatus::Invalid;
    }

    /// Client deactivation: every child challenge is forced invalid
    pub fn deactivate(&mut self) {
        self.status = AuthorizationStatus::Deactivated;
        for challenge in &mut self.challenges {
            challenge.status = ChallengeStatus::Invalid;
        }
    }

    /// Tidy expiry of a pending or valid authorization past `expires`.
    ///
    /// Returns whether the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        let live = matches!(
            self.status,
            AuthorizationStatus::Pending | AuthorizationStatus::Valid
        );
        if live && now > self.expires {
            self.status = AuthorizationStatus::Expired;
            return true;
        }
        false
    }
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

status_display!(OrderStatus);

/// A certificate order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub status: OrderStatus,
    /// Requested identifiers, wildcards included
    pub identifiers: Vec<Identifier>,
    pub authorization_ids: Vec<AuthorizationId>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    pub expires: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub certificate_serial: Option<CertificateSerial>,
    #[serde(default)]
    pub error: Option<Problem>,
}

impl Order {
    /// Recompute a pending/ready order's status from its authorizations.
    ///
    /// `authorizations` holds the loaded record for each id in
    /// `authorization_ids`, `None` where the record is missing. Returns
    /// whether the status changed.
    pub fn refresh_status(
        &mut self,
        authorizations: &[Option<Authorization>],
        now: DateTime<Utc>,
    ) -> bool {
        if !matches!(self.status, OrderStatus::Pending | OrderStatus::Ready) {
            return false;
        }

        let before = self.status;

        if now > self.expires {
            self.status = OrderStatus::Invalid;
            self.error = Some(Problem::new(
                "malformed",
                "order expired before it was finalized",
                http::StatusCode::FORBIDDEN,
            ));
        } else if let Some(failed) = authorizations.iter().find_map(|a| match a {
            None => Some("missing".to_string()),
            Some(a) if a.status.is_failed() => Some(a.status.to_string()),
            Some(_) => None,
        }) {
            self.status = OrderStatus::Invalid;
            self.error = Some(Problem::new(
                "unauthorized",
                format!("an authorization for this order is {}", failed),
                http::StatusCode::FORBIDDEN,
            ));
        } else if !authorizations.is_empty()
            && authorizations.iter().all(|a| {
                a.as_ref()
                    .is_some_and(|a| a.status == AuthorizationStatus::Valid && a.expires > now)
            })
        {
            self.status = OrderStatus::Ready;
        } else {
            self.status = OrderStatus::Pending;
        }

        self.status != before
    }
}

// ============================================================================
// Validation Tasks
// ============================================================================

/// Persisted work item for one (authorization, challenge type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationTask {
    pub account_id: AccountId,
    pub authorization_id: AuthorizationId,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub key_thumbprint: String,
    pub initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub first_validation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl ValidationTask {
    /// Queue id; also the storage key suffix, which makes acceptance
    /// idempotent per (authorization, challenge type)
    pub fn task_id(authorization_id: &AuthorizationId, challenge_type: ChallengeType) -> String {
        format!("{}-{}", authorization_id, challenge_type)
    }

    pub fn id(&self) -> String {
        Self::task_id(&self.authorization_id, self.challenge_type)
    }

    /// Whether the task is still inside its backoff window
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.is_some_and(|after| now < after)
    }

    /// Record a failed attempt with linear backoff: the k-th retry waits
    /// `k * step` after the failure.
    pub fn record_failure(&mut self, now: DateTime<Utc>, step: std::time::Duration) {
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        // a delay that does not fit a timestamp defers forever
        let retry_after = step
            .checked_mul(self.retry_count)
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.retry_after = Some(retry_after);
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// An issued certificate as kept by the CA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub serial: CertificateSerial,
    pub account_id: AccountId,
    pub order_id: OrderId,
    #[serde(with = "b64")]
    pub der: Vec<u8>,
    pub not_after: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revocation_reason: Option<u8>,
}

// ============================================================================
// External Account Binding Keys
// ============================================================================

/// A pre-shared EAB key id provisioned out of band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EabKey {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    /// Account the key was consumed by; keys are single-use
    #[serde(default)]
    pub bound_account: Option<AccountId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn authz(status: AuthorizationStatus, expires: DateTime<Utc>) -> Authorization {
        Authorization {
            id: AuthorizationId::generate(),
            account_id: AccountId::new("acct"),
            identifier: Identifier::dns("example.com"),
            status,
            expires,
            challenges: vec![Challenge::new(ChallengeType::Http01)],
            wildcard: false,
        }
    }

    fn order(expires: DateTime<Utc>) -> Order {
        Order {
            id: OrderId::generate(),
            account_id: AccountId::new("acct"),
            status: OrderStatus::Pending,
            identifiers: vec![Identifier::dns("example.com")],
            authorization_ids: vec![AuthorizationId::generate()],
            not_before: None,
            not_after: None,
            expires,
            created_at: Utc::now(),
            certificate_serial: None,
            error: None,
        }
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_status_display_matches_wire_name() {
        assert_eq!(OrderStatus::Processing.to_string(), "processing");
        assert_eq!(AuthorizationStatus::Deactivated.to_string(), "deactivated");
        assert_eq!(ChallengeStatus::Valid.to_string(), "valid");
    }

    #[test]
    fn test_order_becomes_ready_when_all_valid() {
        let now = Utc::now();
        let mut order = order(now + Duration::hours(1));
        let a = authz(AuthorizationStatus::Valid, now + Duration::days(15));

        assert!(order.refresh_status(&[Some(a)], now));
        assert_eq!(order.status, OrderStatus::Ready);
    }

    #[test]
    fn test_order_stays_pending() {
        let now = Utc::now();
        let mut order = order(now + Duration::hours(1));
        let a = authz(AuthorizationStatus::Pending, now + Duration::hours(1));
        let b = authz(AuthorizationStatus::Valid, now + Duration::days(15));

        assert!(!order.refresh_status(&[Some(a), Some(b)], now));
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[test]
    fn test_order_invalid_on_failed_or_missing_authz() {
        let now = Utc::now();

        let mut failed = order(now + Duration::hours(1));
        let a = authz(AuthorizationStatus::Deactivated, now + Duration::hours(1));
        assert!(failed.refresh_status(&[Some(a)], now));
        assert_eq!(failed.status, OrderStatus::Invalid);
        assert!(failed.error.is_some());

        let mut missing = order(now + Duration::hours(1));
        assert!(missing.refresh_status(&[None], now));
        assert_eq!(missing.status, OrderStatus::Invalid);
    }

    #[test]
    fn test_order_invalid_after_expiry() {
        let now = Utc::now();
        let mut order = order(now - Duration::seconds(1));
        let a = authz(AuthorizationStatus::Valid, now + Duration::days(15));

        assert!(order.refresh_status(&[Some(a)], now));
        assert_eq!(order.status, OrderStatus::Invalid);
    }

    #[test]
    fn test_processing_order_is_not_recomputed() {
        let now = Utc::now();
        let mut order = order(now - Duration::seconds(1));
        order.status = OrderStatus::Processing;

        assert!(!order.refresh_status(&[None], now));
        assert_eq!(order.status, OrderStatus::Processing);
    }

    #[test]
    fn test_deactivate_invalidates_challenges() {
        let mut a = authz(AuthorizationStatus::Pending, Utc::now());
        a.challenges.push(Challenge::new(ChallengeType::Dns01));
        a.deactivate();

        assert_eq!(a.status, AuthorizationStatus::Deactivated);
        assert!(a
            .challenges
            .iter()
            .all(|c| c.status == ChallengeStatus::Invalid));
    }

    #[test]
    fn test_expire_if_due() {
        let now = Utc::now();
        let mut pending = authz(AuthorizationStatus::Pending, now - Duration::seconds(1));
        assert!(pending.expire_if_due(now));
        assert_eq!(pending.status, AuthorizationStatus::Expired);

        let mut invalid = authz(AuthorizationStatus::Invalid, now - Duration::seconds(1));
        assert!(!invalid.expire_if_due(now));
        assert_eq!(invalid.status, AuthorizationStatus::Invalid);
    }

    #[test]
    fn test_record_failure_linear_backoff() {
        let now = Utc::now();
        let mut task = ValidationTask {
            account_id: AccountId::new("acct"),
            authorization_id: AuthorizationId::new("authz"),
            challenge_type: ChallengeType::Http01,
            token: "t".into(),
            key_thumbprint: "k".into(),
            initiated_at: now,
            first_validation_at: None,
            retry_count: 0,
            last_retry_at: None,
            retry_after: None,
        };

        let step = std::time::Duration::from_secs(5);
        for k in 1..=3u32 {
            let failed_at = now + Duration::seconds(i64::from(k) * 100);
            task.record_failure(failed_at, step);
            assert_eq!(task.retry_count, k);
            assert_eq!(task.last_retry_at, Some(failed_at));
            assert_eq!(
                task.retry_after,
                Some(failed_at + Duration::seconds(5 * i64::from(k)))
            );
            assert!(task.is_deferred(failed_at));
        }
        assert_eq!(task.id(), "authz-http-01");
    }

    #[test]
    fn test_record_failure_saturates_huge_backoff() {
        let now = Utc::now();
        let mut task = ValidationTask {
            account_id: AccountId::new("acct"),
            authorization_id: AuthorizationId::new("authz"),
            challenge_type: ChallengeType::Http01,
            token: "t".into(),
            key_thumbprint: "k".into(),
            initiated_at: now,
            first_validation_at: None,
            retry_count: 1,
            last_retry_at: None,
            retry_after: None,
        };

        task.record_failure(now, std::time::Duration::MAX);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.retry_after, Some(DateTime::<Utc>::MAX_UTC));
        assert!(task.is_deferred(now));
    }

    #[test]
    fn test_account_serializes_key_as_base64() {
        let now = Utc::now();
        let account = Account {
            id: AccountId::new("acct"),
            status: AccountStatus::Valid,
            contacts: vec!["mailto:ops@example.com".into()],
            terms_of_service_agreed: true,
            key_thumbprint: "thumb".into(),
            public_key: vec![0x30, 0x59, 0xff],
            external_account_binding: None,
            created_at: now,
            last_access_at: now,
            max_issued_cert_expiry: None,
            revoked_at: None,
        };

        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["publicKey"], "MFn_");
        let back: Account = serde_json::from_value(json).unwrap();
        assert_eq!(back, account);
    }
}
