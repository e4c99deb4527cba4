//! Request payloads, response documents and resource URLs
//!
//! Typed request structures are deserialized from the verified JWS
//! payload and checked at the boundary; response documents are what the
//! router serializes back to the client.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use sentinel_ca_common::{
    AccountId, AuthorizationId, CertificateSerial, ChallengeType, Identifier, OrderId,
};

use super::error::{AcmeError, Problem};
use super::resources::{
    Account, AccountStatus, Authorization, AuthorizationStatus, Challenge, ChallengeStatus,
    Order, OrderStatus,
};

// ============================================================================
// Request Authentication
// ============================================================================

/// Signer resolved by the request authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signer {
    /// Request signed with an embedded key (new-account, key-based revocation)
    Jwk {
        /// RFC 7638 thumbprint of the key
        thumbprint: String,
        /// DER SubjectPublicKeyInfo of the key
        public_key: Vec<u8>,
    },
    /// Request signed by an existing account's key
    Kid(AccountId),
}

// ============================================================================
// Requests
// ============================================================================

/// External account binding, already MAC-verified by the authentication
/// layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccountBinding {
    pub key_id: String,
}

/// `newAccount` payload (RFC 8555 §7.3)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountRequest {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    #[serde(default)]
    pub only_return_existing: bool,
    #[serde(default)]
    pub external_account_binding: Option<ExternalAccountBinding>,
}

impl NewAccountRequest {
    pub fn validate(&self) -> Result<(), AcmeError> {
        validate_contacts(&self.contact)
    }
}

/// Account update payload (RFC 8555 §7.3.2, §7.3.6)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<AccountStatus>,
}

impl UpdateAccountRequest {
    pub fn validate(&self) -> Result<(), AcmeError> {
        if let Some(contacts) = &self.contact {
            validate_contacts(contacts)?;
        }
        match self.status {
            None | Some(AccountStatus::Deactivated) => Ok(()),
            Some(other) => Err(AcmeError::Malformed(format!(
                "account status can only be changed to 'deactivated', not '{}'",
                other
            ))),
        }
    }
}

fn validate_contacts(contacts: &[String]) -> Result<(), AcmeError> {
    for contact in contacts {
        let address = contact.strip_prefix("mailto:").ok_or_else(|| {
            AcmeError::Malformed(format!(
                "unsupported contact '{}': only mailto: is accepted",
                contact
            ))
        })?;
        let valid = address
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
            && !address.contains(',');
        if !valid {
            return Err(AcmeError::Malformed(format!(
                "invalid contact address '{}'",
                contact
            )));
        }
    }
    Ok(())
}

/// `newOrder` payload (RFC 8555 §7.4)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl NewOrderRequest {
    pub fn validate(&self, max_identifiers: usize) -> Result<(), AcmeError> {
        if self.identifiers.is_empty() {
            return Err(AcmeError::Malformed("order has no identifiers".to_string()));
        }
        if self.identifiers.len() > max_identifiers {
            return Err(AcmeError::RejectedIdentifier(format!(
                "order has {} identifiers, at most {} are allowed",
                self.identifiers.len(),
                max_identifiers
            )));
        }
        if let (Some(nb), Some(na)) = (self.not_before, self.not_after) {
            if nb >= na {
                return Err(AcmeError::Malformed(
                    "notBefore must be earlier than notAfter".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Finalize payload (RFC 8555 §7.4)
#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeRequest {
    /// base64url DER CSR
    pub csr: String,
}

impl FinalizeRequest {
    pub fn csr_der(&self) -> Result<Vec<u8>, AcmeError> {
        decode_b64url(&self.csr).map_err(|e| AcmeError::BadCsr(format!("invalid base64url: {}", e)))
    }
}

/// Authorization deactivation payload (RFC 8555 §7.5.2)
#[derive(Debug, Clone, Deserialize)]
pub struct DeactivateAuthorizationRequest {
    pub status: AuthorizationStatus,
}

impl DeactivateAuthorizationRequest {
    pub fn validate(&self) -> Result<(), AcmeError> {
        if self.status != AuthorizationStatus::Deactivated {
            return Err(AcmeError::Malformed(format!(
                "authorization status can only be changed to 'deactivated', not '{}'",
                self.status
            )));
        }
        Ok(())
    }
}

/// `revokeCert` payload (RFC 8555 §7.6)
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    /// base64url DER certificate
    pub certificate: String,
    #[serde(default)]
    pub reason: Option<u8>,
}

impl RevokeRequest {
    pub fn certificate_der(&self) -> Result<Vec<u8>, AcmeError> {
        decode_b64url(&self.certificate)
            .map_err(|e| AcmeError::Malformed(format!("invalid certificate encoding: {}", e)))
    }

    /// RFC 5280 reason codes; 7 is unused and codes above 10 do not exist
    pub fn validate(&self) -> Result<(), AcmeError> {
        match self.reason {
            Some(7) | Some(11..) => Err(AcmeError::Malformed(format!(
                "unsupported revocation reason {}",
                self.reason.unwrap_or_default()
            ))),
            _ => Ok(()),
        }
    }
}

fn decode_b64url(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value.trim_end_matches('=').as_bytes())
}

// ============================================================================
// URLs
// ============================================================================

/// Resource URLs derived from the configured base URL
#[derive(Debug, Clone)]
pub struct Urls {
    base: String,
}

impl Urls {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn directory(&self) -> String {
        format!("{}/directory", self.base)
    }

    pub fn new_nonce(&self) -> String {
        format!("{}/new-nonce", self.base)
    }

    pub fn new_account(&self) -> String {
        format!("{}/new-account", self.base)
    }

    pub fn new_order(&self) -> String {
        format!("{}/new-order", self.base)
    }

    pub fn revoke_cert(&self) -> String {
        format!("{}/revoke-cert", self.base)
    }

    pub fn account(&self, id: &AccountId) -> String {
        format!("{}/account/{}", self.base, id)
    }

    pub fn orders(&self, id: &AccountId) -> String {
        format!("{}/account/{}/orders", self.base, id)
    }

    pub fn order(&self, id: &OrderId) -> String {
        format!("{}/order/{}", self.base, id)
    }

    pub fn finalize(&self, id: &OrderId) -> String {
        format!("{}/order/{}/finalize", self.base, id)
    }

    pub fn authorization(&self, id: &AuthorizationId) -> String {
        format!("{}/authorization/{}", self.base, id)
    }

    pub fn challenge(&self, authz: &AuthorizationId, challenge_type: ChallengeType) -> String {
        format!("{}/challenge/{}/{}", self.base, authz, challenge_type)
    }

    pub fn certificate(&self, serial: &CertificateSerial) -> String {
        format!("{}/cert/{}", self.base, serial)
    }

    /// `Link` header value pointing at the directory
    pub fn index_link(&self) -> String {
        format!("<{}>;rel=\"index\"", self.directory())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Handler result with the headers every ACME response carries
#[derive(Debug, Clone)]
pub struct AcmeResponse<T> {
    pub status: StatusCode,
    pub location: Option<String>,
    /// Fresh `Replay-Nonce`
    pub replay_nonce: String,
    /// `Link: <directory>;rel="index"`
    pub link: String,
    pub body: T,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    pub external_account_required: bool,
}

/// Directory document (RFC 8555 §7.1.1)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,
    pub meta: DirectoryMeta,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub status: AccountStatus,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    pub orders: String,
}

impl AccountView {
    pub fn new(account: &Account, urls: &Urls) -> Self {
        Self {
            status: account.status,
            contact: account.contacts.clone(),
            terms_of_service_agreed: account.terms_of_service_agreed,
            orders: urls.orders(&account.id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl OrderView {
    pub fn new(order: &Order, urls: &Urls) -> Self {
        Self {
            status: order.status,
            expires: order.expires,
            identifiers: order.identifiers.clone(),
            not_before: order.not_before,
            not_after: order.not_after,
            authorizations: order
                .authorization_ids
                .iter()
                .map(|id| urls.authorization(id))
                .collect(),
            finalize: urls.finalize(&order.id),
            certificate: order
                .certificate_serial
                .as_ref()
                .map(|serial| urls.certificate(serial)),
            error: order.error.clone(),
        }
    }
}

/// Orders list (RFC 8555 §7.1.2.1)
#[derive(Debug, Clone, Serialize)]
pub struct OrderListView {
    pub orders: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeView {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl ChallengeView {
    pub fn new(authz: &AuthorizationId, challenge: &Challenge, urls: &Urls) -> Self {
        Self {
            challenge_type: challenge.challenge_type,
            url: urls.challenge(authz, challenge.challenge_type),
            status: challenge.status,
            token: challenge.token.clone(),
            validated: challenge.validated_at,
            error: challenge.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationView {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<ChallengeView>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wildcard: bool,
}

impl AuthorizationView {
    pub fn new(authz: &Authorization, urls: &Urls) -> Self {
        Self {
            identifier: authz.identifier.clone(),
            status: authz.status,
            expires: authz.expires,
            challenges: authz
                .challenges
                .iter()
                .map(|c| ChallengeView::new(&authz.id, c, urls))
                .collect(),
            wildcard: authz.wildcard,
        }
    }
}
