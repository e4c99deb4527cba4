//! Pluggable policy collaborators
//!
//! Decisions the protocol engine delegates: which identifiers may be
//! ordered, which challenges an authorization offers, whether new accounts
//! need an external account binding, and how certificates are signed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use sentinel_ca_common::{AccountId, CertificateSerial, ChallengeType, Identifier};
use sentinel_ca_config::EabPolicyMode;

use super::challenge::supports;
use super::error::AcmeError;
use super::protocol::ExternalAccountBinding;
use super::resources::{Account, Order};
use super::store::ResourceStore;

// ============================================================================
// Challenge Selection
// ============================================================================

/// Chooses the challenges offered for a new authorization
pub trait ChallengeSelector: Send + Sync {
    /// Challenge types for an authorization of `identifier`. An empty
    /// result means the identifier cannot be authorized.
    fn select(&self, identifier: &Identifier, wildcard: bool) -> Vec<ChallengeType>;
}

/// Offers every configured challenge type the identifier supports
#[derive(Debug, Clone)]
pub struct ConfiguredChallengeSelector {
    offered: Vec<ChallengeType>,
}

impl ConfiguredChallengeSelector {
    pub fn new(offered: Vec<ChallengeType>) -> Self {
        let mut unique = Vec::with_capacity(offered.len());
        for ty in offered {
            if !unique.contains(&ty) {
                unique.push(ty);
            }
        }
        Self { offered: unique }
    }
}

impl ChallengeSelector for ConfiguredChallengeSelector {
    fn select(&self, identifier: &Identifier, wildcard: bool) -> Vec<ChallengeType> {
        self.offered
            .iter()
            .copied()
            .filter(|ty| supports(*ty, identifier, wildcard))
            .collect()
    }
}

// ============================================================================
// Identifier Policy
// ============================================================================

/// Decides whether an account may order a set of identifiers
#[async_trait]
pub trait IdentifierPolicy: Send + Sync {
    async fn check(&self, account: &Account, identifiers: &[Identifier]) -> Result<(), AcmeError>;
}

/// Permits every syntactically valid identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllIdentifiers;

#[async_trait]
impl IdentifierPolicy for AllowAllIdentifiers {
    async fn check(
        &self,
        _account: &Account,
        _identifiers: &[Identifier],
    ) -> Result<(), AcmeError> {
        Ok(())
    }
}

/// Permits DNS names equal to or below one of the listed domains
#[derive(Debug, Clone)]
pub struct AllowedDomains {
    domains: Vec<String>,
}

impl AllowedDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.into().trim_end_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn permits(&self, name: &str) -> bool {
        self.domains
            .iter()
            .any(|d| name == d || name.ends_with(&format!(".{}", d)))
    }
}

#[async_trait]
impl IdentifierPolicy for AllowedDomains {
    async fn check(&self, _account: &Account, identifiers: &[Identifier]) -> Result<(), AcmeError> {
        for identifier in identifiers {
            if !self.permits(&identifier.base().value) {
                return Err(AcmeError::RejectedIdentifier(identifier.value.clone()));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Certificate Issuance
// ============================================================================

/// A certificate returned by the issuer
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub serial: CertificateSerial,
    pub der: Vec<u8>,
    pub not_after: DateTime<Utc>,
}

/// Signs certificates for finalized orders
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue for `order` from a DER CSR whose names already match the order
    async fn issue(&self, order: &Order, csr_der: &[u8]) -> Result<IssuedCertificate, AcmeError>;
}

// ============================================================================
// External Account Binding
// ============================================================================

/// Enforces external account binding on account creation
#[async_trait]
pub trait EabPolicy: Send + Sync {
    /// Whether the directory advertises `externalAccountRequired`
    fn required(&self) -> bool;

    /// Check the binding presented with a new-account request. Returns the
    /// key id to record on the account, if any.
    async fn check_new_account(
        &self,
        binding: Option<&ExternalAccountBinding>,
    ) -> Result<Option<String>, AcmeError>;

    /// Called once the account using `key_id` has been persisted
    async fn bind(&self, _key_id: &str, _account: &AccountId) -> Result<(), AcmeError> {
        Ok(())
    }
}

/// EAB policy backed by keys provisioned under `acme/eab/`.
///
/// The binding's MAC has been verified by the request authentication layer
/// by the time it reaches here; this policy checks that the key id exists
/// and has not been consumed by another account.
pub struct StoredEabPolicy {
    mode: EabPolicyMode,
    store: Arc<ResourceStore>,
}

impl StoredEabPolicy {
    pub fn new(mode: EabPolicyMode, store: Arc<ResourceStore>) -> Self {
        Self { mode, store }
    }
}

#[async_trait]
impl EabPolicy for StoredEabPolicy {
    fn required(&self) -> bool {
        self.mode.is_required()
    }

    async fn check_new_account(
        &self,
        binding: Option<&ExternalAccountBinding>,
    ) -> Result<Option<String>, AcmeError> {
        let binding = match (self.mode, binding) {
            (EabPolicyMode::NotRequired, _) => return Ok(None),
            (EabPolicyMode::NewAccountRequired, None) => {
                return Err(AcmeError::ExternalAccountRequired)
            }
            (EabPolicyMode::Optional, None) => return Ok(None),
            (_, Some(binding)) => binding,
        };

        let key = self
            .store
            .get_eab_key(&binding.key_id)
            .await?
            .ok_or_else(|| {
                AcmeError::Unauthorized(format!("unknown EAB key id '{}'", binding.key_id))
            })?;

        if let Some(bound) = &key.bound_account {
            debug!(key_id = %key.key_id, bound_account = %bound, "EAB key already consumed");
            return Err(AcmeError::Unauthorized(format!(
                "EAB key id '{}' has already been used",
                key.key_id
            )));
        }
        Ok(Some(key.key_id))
    }

    async fn bind(&self, key_id: &str, account: &AccountId) -> Result<(), AcmeError> {
        let Some(mut key) = self.store.get_eab_key(key_id).await? else {
            return Err(AcmeError::ServerInternal(format!(
                "EAB key id '{}' vanished during account creation",
                key_id
            )));
        };
        key.bound_account = Some(account.clone());
        self.store.put_eab_key(&key).await?;
        info!(key_id = %key_id, account_id = %account, "Bound EAB key to account");
        Ok(())
    }
}

impl std::fmt::Debug for StoredEabPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredEabPolicy")
            .field("mode", &self.mode)
            .finish()
    }
}
