//! ACME request handlers
//!
//! [`AcmeService`] implements the protocol operations on top of the
//! resource store and the validation engine. Requests reach it already
//! authenticated: the router has verified the JWS, redeemed the nonce
//! through [`AcmeService::redeem_nonce`] and resolved the signer. Every
//! handler returns an [`AcmeResponse`] carrying a fresh nonce, or an
//! [`AcmeError`] that the router turns into a problem document with
//! [`AcmeService::error_response`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::StatusCode;
use tracing::{debug, info, warn};
use x509_parser::prelude::{
    FromDer, GeneralName, ParsedExtension, X509Certificate, X509CertificationRequest,
};

use sentinel_ca_common::{
    AccountId, AuthorizationId, CertificateSerial, ChallengeType, Identifier, OrderId,
};
use sentinel_ca_config::{AccountConfig, Config, OrderConfig};

use super::clock::Clock;
use super::engine::EngineHandle;
use super::error::{AcmeError, Problem};
use super::metrics::AcmeMetrics;
use super::nonce::NonceRegistry;
use super::policy::{CertificateIssuer, ChallengeSelector, EabPolicy, IdentifierPolicy};
use super::protocol::{
    AccountView, AcmeResponse, AuthorizationView, ChallengeView, DeactivateAuthorizationRequest,
    Directory, DirectoryMeta, FinalizeRequest, NewAccountRequest, NewOrderRequest, OrderListView,
    OrderView, RevokeRequest, Signer, UpdateAccountRequest, Urls,
};
use super::resources::{
    Account, AccountStatus, Authorization, AuthorizationStatus, CertificateRecord, Challenge,
    Order, OrderStatus, ValidationTask,
};
use super::store::ResourceStore;

/// Externally supplied decisions
#[derive(Clone)]
pub struct Policies {
    pub identifiers: Arc<dyn IdentifierPolicy>,
    pub challenges: Arc<dyn ChallengeSelector>,
    pub eab: Arc<dyn EabPolicy>,
    pub issuer: Arc<dyn CertificateIssuer>,
}

/// The ACME protocol service
pub struct AcmeService {
    urls: Urls,
    orders: OrderConfig,
    accounts: AccountConfig,
    store: Arc<ResourceStore>,
    engine: EngineHandle,
    nonces: Arc<NonceRegistry>,
    policies: Policies,
    clock: Arc<dyn Clock>,
    metrics: Arc<AcmeMetrics>,
}

impl AcmeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        store: Arc<ResourceStore>,
        engine: EngineHandle,
        nonces: Arc<NonceRegistry>,
        policies: Policies,
        clock: Arc<dyn Clock>,
        metrics: Arc<AcmeMetrics>,
    ) -> Self {
        Self {
            urls: Urls::new(config.server.base_url_trimmed()),
            orders: config.orders.clone(),
            accounts: config.accounts.clone(),
            store,
            engine,
            nonces,
            policies,
            clock,
            metrics,
        }
    }

    pub fn urls(&self) -> &Urls {
        &self.urls
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn nonces(&self) -> &Arc<NonceRegistry> {
        &self.nonces
    }

    // =========================================================================
    // Responses
    // =========================================================================

    fn respond<T>(&self, status: StatusCode, location: Option<String>, body: T) -> AcmeResponse<T> {
        let (replay_nonce, _) = self.nonces.issue();
        self.metrics.record_nonce_issued("response");
        AcmeResponse {
            status,
            location,
            replay_nonce,
            link: self.urls.index_link(),
            body,
        }
    }

    /// Problem response for a failed request. Carries a fresh nonce so
    /// that the client can retry immediately (RFC 8555 §6.5).
    pub fn error_response(&self, error: &AcmeError) -> AcmeResponse<Problem> {
        match error {
            AcmeError::ServerInternal(_) | AcmeError::Storage(_) => {
                warn!(error = %error, "Request failed with an internal error");
            }
            _ => debug!(error = %error, kind = error.kind(), "Request rejected"),
        }
        self.respond(error.status(), None, error.problem())
    }

    // =========================================================================
    // Directory & Nonces
    // =========================================================================

    pub fn directory(&self) -> Directory {
        Directory {
            new_nonce: self.urls.new_nonce(),
            new_account: self.urls.new_account(),
            new_order: self.urls.new_order(),
            revoke_cert: self.urls.revoke_cert(),
            meta: DirectoryMeta {
                terms_of_service: self.accounts.terms_of_service.clone(),
                website: self.accounts.website.clone(),
                external_account_required: self.policies.eab.required(),
            },
        }
    }

    /// `newNonce`; also gives the registry a chance to sweep
    pub fn new_nonce(&self) -> AcmeResponse<()> {
        if self.nonces.maybe_tidy() {
            debug!(outstanding = self.nonces.len(), "Swept expired nonces");
        }
        let (replay_nonce, _) = self.nonces.issue();
        self.metrics.record_nonce_issued("new-nonce");
        AcmeResponse {
            status: StatusCode::OK,
            location: None,
            replay_nonce,
            link: self.urls.index_link(),
            body: (),
        }
    }

    /// Called by the authentication layer right after header parsing
    pub fn redeem_nonce(&self, nonce: &str) -> Result<(), AcmeError> {
        if self.nonces.redeem(nonce) {
            Ok(())
        } else {
            Err(AcmeError::BadNonce)
        }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Search-only lookup by key thumbprint
    pub async fn load_account_by_key(
        &self,
        thumbprint: &str,
    ) -> Result<Option<Account>, AcmeError> {
        Ok(self.store.account_by_thumbprint(thumbprint).await?)
    }

    /// Load the signing account, require it to be valid and record access
    async fn authenticate(&self, kid: &AccountId) -> Result<Account, AcmeError> {
        let mut account = self
            .store
            .get_account(kid)
            .await?
            .ok_or(AcmeError::AccountDoesNotExist)?;

        if !account.is_valid() {
            return Err(AcmeError::Unauthorized(format!(
                "account is {}",
                account.status
            )));
        }

        account.last_access_at = self.clock.now();
        self.store.put_account(&account).await?;
        Ok(account)
    }

    pub async fn new_account(
        &self,
        signer: &Signer,
        request: NewAccountRequest,
    ) -> Result<AcmeResponse<AccountView>, AcmeError> {
        let Signer::Jwk {
            thumbprint,
            public_key,
        } = signer
        else {
            return Err(AcmeError::Malformed(
                "newAccount requests must be signed with a JWK".to_string(),
            ));
        };
        request.validate()?;

        if let Some(mut existing) = self.store.account_by_thumbprint(thumbprint).await? {
            if !existing.is_valid() {
                return Err(AcmeError::Unauthorized(format!(
                    "account is {}",
                    existing.status
                )));
            }
            existing.last_access_at = self.clock.now();
            self.store.put_account(&existing).await?;

            debug!(account_id = %existing.id, "newAccount for known key");
            let location = self.urls.account(&existing.id);
            return Ok(self.respond(
                StatusCode::OK,
                Some(location),
                AccountView::new(&existing, &self.urls),
            ));
        }

        if request.only_return_existing {
            return Err(AcmeError::AccountDoesNotExist);
        }

        if self.accounts.require_tos && !request.terms_of_service_agreed {
            return Err(AcmeError::UserActionRequired(
                "the terms of service must be agreed to".to_string(),
            ));
        }

        let eab_key = self
            .policies
            .eab
            .check_new_account(request.external_account_binding.as_ref())
            .await?;

        let now = self.clock.now();
        let account = Account {
            id: AccountId::generate(),
            status: AccountStatus::Valid,
            contacts: request.contact,
            terms_of_service_agreed: request.terms_of_service_agreed,
            key_thumbprint: thumbprint.clone(),
            public_key: public_key.clone(),
            external_account_binding: eab_key.clone(),
            created_at: now,
            last_access_at: now,
            max_issued_cert_expiry: None,
            revoked_at: None,
        };

        // index first: a dangling index entry resolves to "no account"
        self.store.put_thumbprint(thumbprint, &account.id).await?;
        self.store.put_account(&account).await?;

        if let Some(key_id) = &eab_key {
            self.policies.eab.bind(key_id, &account.id).await?;
        }

        self.metrics.record_created("account");
        info!(
            account_id = %account.id,
            contacts = account.contacts.len(),
            eab = eab_key.is_some(),
            "Created ACME account"
        );

        let location = self.urls.account(&account.id);
        Ok(self.respond(
            StatusCode::CREATED,
            Some(location),
            AccountView::new(&account, &self.urls),
        ))
    }

    fn require_self(kid: &AccountId, account_id: &AccountId) -> Result<(), AcmeError> {
        if kid != account_id {
            return Err(AcmeError::Unauthorized(
                "requests for an account must be signed by that account".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn get_account(
        &self,
        kid: &AccountId,
        account_id: &AccountId,
    ) -> Result<AcmeResponse<AccountView>, AcmeError> {
        Self::require_self(kid, account_id)?;
        let account = self.authenticate(kid).await?;
        Ok(self.respond(
            StatusCode::OK,
            Some(self.urls.account(&account.id)),
            AccountView::new(&account, &self.urls),
        ))
    }

    /// Contact update and deactivation. Deactivation leaves the account's
    /// orders and authorizations as they are.
    pub async fn update_account(
        &self,
        kid: &AccountId,
        account_id: &AccountId,
        request: UpdateAccountRequest,
    ) -> Result<AcmeResponse<AccountView>, AcmeError> {
        Self::require_self(kid, account_id)?;
        request.validate()?;
        let mut account = self.authenticate(kid).await?;

        if let Some(contacts) = request.contact {
            account.contacts = contacts;
        }
        if request.status == Some(AccountStatus::Deactivated) {
            account.deactivate(self.clock.now());
            info!(account_id = %account.id, "Account deactivated by client");
        }
        self.store.put_account(&account).await?;

        Ok(self.respond(
            StatusCode::OK,
            Some(self.urls.account(&account.id)),
            AccountView::new(&account, &self.urls),
        ))
    }

    // =========================================================================
    // Orders
    // =========================================================================

    pub async fn new_order(
        &self,
        kid: &AccountId,
        request: NewOrderRequest,
    ) -> Result<AcmeResponse<OrderView>, AcmeError> {
        let account = self.authenticate(kid).await?;
        request.validate(self.orders.max_identifiers)?;

        let mut identifiers: Vec<Identifier> = Vec::with_capacity(request.identifiers.len());
        for requested in &request.identifiers {
            let normalized = requested
                .normalized()
                .map_err(|e| AcmeError::RejectedIdentifier(e.to_string()))?;
            if !identifiers.contains(&normalized) {
                identifiers.push(normalized);
            }
        }

        self.policies
            .identifiers
            .check(&account, &identifiers)
            .await?;

        let now = self.clock.now();
        if let Some(not_after) = request.not_after {
            if not_after <= now {
                return Err(AcmeError::Malformed("notAfter is in the past".to_string()));
            }
            let max = after(now, self.orders.certificate_lifetime());
            if max.is_some_and(|max| not_after > max) {
                return Err(AcmeError::Malformed(format!(
                    "notAfter exceeds the maximum certificate lifetime of {} days",
                    self.orders.certificate_lifetime_days
                )));
            }
        }

        let expires = after(now, self.orders.lifetime()).ok_or_else(|| {
            AcmeError::ServerInternal("order lifetime is out of range".to_string())
        })?;
        let mut authorizations = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let base = identifier.base();
            let wildcard = identifier.is_wildcard();
            let challenge_types = self.policies.challenges.select(&base, wildcard);
            if challenge_types.is_empty() {
                return Err(AcmeError::UnsupportedIdentifier(format!(
                    "no challenge type can validate {}",
                    identifier.value
                )));
            }

            authorizations.push(Authorization {
                id: AuthorizationId::generate(),
                account_id: account.id.clone(),
                identifier: base,
                status: AuthorizationStatus::Pending,
                expires,
                challenges: challenge_types.into_iter().map(Challenge::new).collect(),
                wildcard,
            });
        }

        let order = Order {
            id: OrderId::generate(),
            account_id: account.id.clone(),
            status: OrderStatus::Pending,
            identifiers,
            authorization_ids: authorizations.iter().map(|a| a.id.clone()).collect(),
            not_before: request.not_before,
            not_after: request.not_after,
            expires,
            created_at: now,
            certificate_serial: None,
            error: None,
        };

        for authz in &authorizations {
            self.store.put_authorization(authz).await?;
            self.metrics.record_created("authorization");
        }
        self.store.put_order(&order).await?;
        self.metrics.record_created("order");

        info!(
            account_id = %account.id,
            order_id = %order.id,
            identifiers = order.identifiers.len(),
            expires = %order.expires,
            "Created order"
        );

        Ok(self.respond(
            StatusCode::CREATED,
            Some(self.urls.order(&order.id)),
            OrderView::new(&order, &self.urls),
        ))
    }

    /// Order URLs of the account; invalid orders are left out
    pub async fn list_orders(
        &self,
        kid: &AccountId,
        account_id: &AccountId,
    ) -> Result<AcmeResponse<OrderListView>, AcmeError> {
        Self::require_self(kid, account_id)?;
        let account = self.authenticate(kid).await?;

        let mut orders = self.store.list_orders(&account.id).await?;
        let mut urls = Vec::with_capacity(orders.len());
        for order in &mut orders {
            self.refresh_order(order).await?;
            if order.status != OrderStatus::Invalid {
                urls.push(self.urls.order(&order.id));
            }
        }

        Ok(self.respond(StatusCode::OK, None, OrderListView { orders: urls }))
    }

    pub async fn get_order(
        &self,
        kid: &AccountId,
        order_id: &OrderId,
    ) -> Result<AcmeResponse<OrderView>, AcmeError> {
        let account = self.authenticate(kid).await?;
        let mut order = self.owned_order(&account, order_id).await?;
        self.refresh_order(&mut order).await?;

        Ok(self.respond(
            StatusCode::OK,
            Some(self.urls.order(&order.id)),
            OrderView::new(&order, &self.urls),
        ))
    }

    pub async fn finalize_order(
        &self,
        kid: &AccountId,
        order_id: &OrderId,
        request: FinalizeRequest,
    ) -> Result<AcmeResponse<OrderView>, AcmeError> {
        let mut account = self.authenticate(kid).await?;
        let mut order = self.owned_order(&account, order_id).await?;
        self.refresh_order(&mut order).await?;

        if order.status != OrderStatus::Ready {
            return Err(AcmeError::OrderNotReady(order.status.to_string()));
        }

        let csr_der = request.csr_der()?;
        let requested = csr_identifiers(&csr_der)?;
        let mut expected = order.identifiers.clone();
        sort_identifiers(&mut expected);
        if requested != expected {
            return Err(AcmeError::BadCsr(
                "CSR names do not match the order's identifiers".to_string(),
            ));
        }

        order.status = OrderStatus::Processing;
        self.store.put_order(&order).await?;

        let issued = match self.policies.issuer.issue(&order, &csr_der).await {
            Ok(issued) => issued,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Certificate issuance failed");
                order.status = OrderStatus::Invalid;
                order.error = Some(e.problem());
                self.store.put_order(&order).await?;
                return Err(e);
            }
        };

        let now = self.clock.now();
        let record = CertificateRecord {
            serial: issued.serial.clone(),
            account_id: account.id.clone(),
            order_id: order.id.clone(),
            der: issued.der,
            not_after: issued.not_after,
            issued_at: now,
            revoked_at: None,
            revocation_reason: None,
        };
        self.store.put_certificate(&record).await?;

        order.status = OrderStatus::Valid;
        order.certificate_serial = Some(issued.serial.clone());
        self.store.put_order(&order).await?;

        account.note_issued(issued.not_after);
        self.store.put_account(&account).await?;
        self.metrics.record_certificate("issued");

        info!(
            account_id = %account.id,
            order_id = %order.id,
            serial = %issued.serial,
            not_after = %issued.not_after,
            "Issued certificate"
        );

        Ok(self.respond(
            StatusCode::OK,
            Some(self.urls.order(&order.id)),
            OrderView::new(&order, &self.urls),
        ))
    }

    /// DER certificate for the owning account
    pub async fn get_certificate(
        &self,
        kid: &AccountId,
        serial: &CertificateSerial,
    ) -> Result<AcmeResponse<Vec<u8>>, AcmeError> {
        let account = self.authenticate(kid).await?;
        let record = self
            .store
            .get_certificate(serial)
            .await?
            .ok_or_else(|| AcmeError::NotFound(format!("certificate {}", serial)))?;
        if record.account_id != account.id {
            return Err(AcmeError::Unauthorized(
                "certificate belongs to another account".to_string(),
            ));
        }

        Ok(self.respond(StatusCode::OK, None, record.der))
    }

    async fn owned_order(&self, account: &Account, order_id: &OrderId) -> Result<Order, AcmeError> {
        if let Some(order) = self.store.get_order(&account.id, order_id).await? {
            return Ok(order);
        }
        match self.store.order_owner(order_id).await? {
            Some(_) => Err(AcmeError::Unauthorized(
                "order belongs to another account".to_string(),
            )),
            None => Err(AcmeError::NotFound(format!("order {}", order_id))),
        }
    }

    /// Recompute a pending/ready order from its authorizations, persisting
    /// any change
    async fn refresh_order(&self, order: &mut Order) -> Result<(), AcmeError> {
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Ok(());
        }

        let mut authorizations = Vec::with_capacity(order.authorization_ids.len());
        for id in &order.authorization_ids {
            authorizations.push(self.store.get_authorization(&order.account_id, id).await?);
        }

        let before = order.status;
        if order.refresh_status(&authorizations, self.clock.now()) {
            self.store.put_order(order).await?;
            debug!(
                order_id = %order.id,
                from = %before,
                to = %order.status,
                "Order status changed"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Authorizations & Challenges
    // =========================================================================

    async fn owned_authorization(
        &self,
        account: &Account,
        authz_id: &AuthorizationId,
    ) -> Result<Authorization, AcmeError> {
        if let Some(authz) = self.store.get_authorization(&account.id, authz_id).await? {
            return Ok(authz);
        }
        match self.store.authorization_owner(authz_id).await? {
            Some(_) => Err(AcmeError::Unauthorized(
                "authorization belongs to another account".to_string(),
            )),
            None => Err(AcmeError::NotFound(format!("authorization {}", authz_id))),
        }
    }

    pub async fn get_authorization(
        &self,
        kid: &AccountId,
        authz_id: &AuthorizationId,
    ) -> Result<AcmeResponse<AuthorizationView>, AcmeError> {
        let account = self.authenticate(kid).await?;
        let authz = self.owned_authorization(&account, authz_id).await?;
        Ok(self.respond(
            StatusCode::OK,
            None,
            AuthorizationView::new(&authz, &self.urls),
        ))
    }

    /// Client deactivation: every challenge becomes invalid and pending
    /// validation work is dropped
    pub async fn deactivate_authorization(
        &self,
        kid: &AccountId,
        authz_id: &AuthorizationId,
        request: DeactivateAuthorizationRequest,
    ) -> Result<AcmeResponse<AuthorizationView>, AcmeError> {
        request.validate()?;
        let account = self.authenticate(kid).await?;
        let mut authz = self.owned_authorization(&account, authz_id).await?;

        if !matches!(
            authz.status,
            AuthorizationStatus::Pending | AuthorizationStatus::Valid
        ) {
            return Err(AcmeError::Malformed(format!(
                "cannot deactivate an authorization that is {}",
                authz.status
            )));
        }

        authz.deactivate();
        self.store.put_authorization(&authz).await?;

        let removed = self.store.delete_tasks_for(&authz).await?;
        for challenge in &authz.challenges {
            self.engine
                .forget(&ValidationTask::task_id(&authz.id, challenge.challenge_type));
        }

        info!(
            account_id = %account.id,
            authorization_id = %authz.id,
            tasks_removed = removed,
            "Authorization deactivated"
        );

        Ok(self.respond(
            StatusCode::OK,
            None,
            AuthorizationView::new(&authz, &self.urls),
        ))
    }

    /// Fetch a challenge. Never starts validation.
    pub async fn get_challenge(
        &self,
        kid: &AccountId,
        authz_id: &AuthorizationId,
        challenge_type: ChallengeType,
    ) -> Result<AcmeResponse<ChallengeView>, AcmeError> {
        let account = self.authenticate(kid).await?;
        let authz = self.owned_authorization(&account, authz_id).await?;
        self.challenge_response(&authz, challenge_type)
    }

    /// Start validation of a challenge (the empty-body POST)
    pub async fn accept_challenge(
        &self,
        kid: &AccountId,
        authz_id: &AuthorizationId,
        challenge_type: ChallengeType,
    ) -> Result<AcmeResponse<ChallengeView>, AcmeError> {
        let account = self.authenticate(kid).await?;
        // ownership check before the engine touches anything
        self.owned_authorization(&account, authz_id).await?;

        let authz = self
            .engine
            .accept(&account, authz_id, challenge_type)
            .await?;
        self.challenge_response(&authz, challenge_type)
    }

    fn challenge_response(
        &self,
        authz: &Authorization,
        challenge_type: ChallengeType,
    ) -> Result<AcmeResponse<ChallengeView>, AcmeError> {
        let challenge = authz.challenge(challenge_type).ok_or_else(|| {
            AcmeError::NotFound(format!(
                "challenge {} of authorization {}",
                challenge_type, authz.id
            ))
        })?;
        Ok(self.respond(
            StatusCode::OK,
            None,
            ChallengeView::new(&authz.id, challenge, &self.urls),
        ))
    }

    // =========================================================================
    // Revocation
    // =========================================================================

    /// `revokeCert`, signed either by the certificate's key (proof of
    /// possession) or by the account the certificate was issued to
    pub async fn revoke_certificate(
        &self,
        signer: &Signer,
        request: RevokeRequest,
    ) -> Result<AcmeResponse<()>, AcmeError> {
        request.validate()?;
        let der = request.certificate_der()?;
        let presented = PresentedCertificate::parse(&der)?;

        let mut record = self
            .store
            .get_certificate(&presented.serial)
            .await?
            .ok_or_else(|| {
                AcmeError::NotFound(format!("certificate {} was not issued here", presented.serial))
            })?;
        if record.der != der {
            return Err(AcmeError::Malformed(
                "presented certificate does not match the issued certificate".to_string(),
            ));
        }

        match signer {
            Signer::Jwk { public_key, .. } => {
                if *public_key != presented.public_key {
                    return Err(AcmeError::Unauthorized(
                        "request is not signed by the certificate's key".to_string(),
                    ));
                }
            }
            Signer::Kid(kid) => {
                let account = self.authenticate(kid).await?;
                if record.account_id != account.id {
                    return Err(AcmeError::Unauthorized(
                        "certificate was issued to another account".to_string(),
                    ));
                }
            }
        }

        if record.revoked_at.is_some() {
            return Err(AcmeError::AlreadyRevoked);
        }
        let now = self.clock.now();
        if presented.not_after < now {
            return Err(AcmeError::Malformed(
                "certificate has already expired".to_string(),
            ));
        }

        record.revoked_at = Some(now);
        record.revocation_reason = request.reason;
        self.store.put_certificate(&record).await?;
        self.metrics.record_certificate("revoked");

        info!(
            serial = %record.serial,
            account_id = %record.account_id,
            reason = ?request.reason,
            "Certificate revoked"
        );

        Ok(self.respond(StatusCode::OK, None, ()))
    }
}

impl fmt::Debug for AcmeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeService")
            .field("urls", &self.urls)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// X.509 Helpers
// ============================================================================

/// Fields of a certificate presented for revocation
struct PresentedCertificate {
    serial: CertificateSerial,
    not_after: DateTime<Utc>,
    /// DER SubjectPublicKeyInfo
    public_key: Vec<u8>,
}

impl PresentedCertificate {
    fn parse(der: &[u8]) -> Result<Self, AcmeError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| AcmeError::Malformed(format!("unable to parse certificate: {}", e)))?;
        let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| AcmeError::Malformed("certificate notAfter out of range".to_string()))?;

        Ok(Self {
            serial: CertificateSerial::from_bytes(cert.raw_serial()),
            not_after,
            public_key: cert.public_key().raw.to_vec(),
        })
    }
}

/// Normalized, sorted, de-duplicated names requested by a CSR: subject
/// common names plus DNS and IP subjectAltNames
fn csr_identifiers(der: &[u8]) -> Result<Vec<Identifier>, AcmeError> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| AcmeError::BadCsr(format!("unable to parse CSR: {}", e)))?;

    let mut names = Vec::new();
    for cn in csr.certification_request_info.subject.iter_common_name() {
        let value = cn
            .as_str()
            .map_err(|e| AcmeError::BadCsr(format!("unreadable common name: {}", e)))?;
        names.push(match value.parse::<IpAddr>() {
            Ok(_) => Identifier::ip(value),
            Err(_) => Identifier::dns(value),
        });
    }

    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            let ParsedExtension::SubjectAlternativeName(san) = extension else {
                continue;
            };
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => names.push(Identifier::dns(*dns)),
                    GeneralName::IPAddress(bytes) => {
                        names.push(Identifier::ip(ip_from_bytes(bytes)?.to_string()))
                    }
                    other => {
                        return Err(AcmeError::BadCsr(format!(
                            "unsupported subjectAltName {:?}",
                            other
                        )))
                    }
                }
            }
        }
    }

    if names.is_empty() {
        return Err(AcmeError::BadCsr("CSR contains no names".to_string()));
    }

    let mut identifiers = names
        .iter()
        .map(|name| {
            name.normalized()
                .map_err(|e| AcmeError::BadCsr(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    sort_identifiers(&mut identifiers);
    Ok(identifiers)
}

fn sort_identifiers(identifiers: &mut Vec<Identifier>) {
    identifiers.sort_by(|a, b| (a.kind.as_str(), &a.value).cmp(&(b.kind.as_str(), &b.value)));
    identifiers.dedup();
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr, AcmeError> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(v6)));
    }
    Err(AcmeError::BadCsr(format!(
        "invalid IP address of {} bytes in subjectAltName",
        bytes.len()
    )))
}

/// `at + d`, or `None` past the representable range
fn after(at: DateTime<Utc>, d: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}
