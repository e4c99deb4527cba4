//! Shared test utilities for integration tests
//!
//! A [`Harness`] wires an [`AcmeService`] to in-memory storage, a scripted
//! challenge validator and the local issuer, on tokio's paused clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, KeyPair, PublicKeyData};
use tokio::task::JoinHandle;

use sentinel_ca::acme::{
    AcmeMetrics, AcmeService, AllowAllIdentifiers, Authorization, ChallengeValidator, Clock,
    ConfiguredChallengeSelector, EngineHandle, LocalIssuer, NewAccountRequest, NewOrderRequest,
    NonceRegistry, Order, Policies, ResourceStore, Signer, StoredEabPolicy, TokioClock,
    ValidationEngine, ValidationError,
};
use sentinel_ca::MemoryStorage;
use sentinel_ca_common::{AccountId, AuthorizationId, ChallengeType, Identifier};
use sentinel_ca_config::{Config, StorageBackend};

pub const BASE_URL: &str = "https://ca.test/acme";

/// Minimal configuration on the memory backend
pub fn test_config() -> Config {
    let mut config = Config::from_kdl(&format!("server {{\n    base-url \"{}\"\n}}\n", BASE_URL))
        .expect("test config parses");
    config.storage.backend = StorageBackend::Memory;
    config.validation.challenge_types = vec![ChallengeType::Http01, ChallengeType::Dns01];
    config
}

/// Last path segment of a resource URL
pub fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

// ============================================================================
// Scripted Validator
// ============================================================================

/// Challenge validator returning a configurable result
#[derive(Debug)]
pub struct MockValidator {
    result: Mutex<Result<(), ValidationError>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(ChallengeType, Identifier, String, String)>>,
}

impl MockValidator {
    pub fn passing() -> Arc<Self> {
        Self::with_result(Ok(()))
    }

    pub fn failing() -> Arc<Self> {
        Self::with_result(Err(ValidationError::Connection {
            target: "example.com".to_string(),
            message: "connection refused".to_string(),
        }))
    }

    fn with_result(result: Result<(), ValidationError>) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(result),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_result(&self, result: Result<(), ValidationError>) {
        *self.result.lock().unwrap() = result;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (challenge type, identifier, token, thumbprint) of every call
    pub fn seen(&self) -> Vec<(ChallengeType, Identifier, String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChallengeValidator for MockValidator {
    async fn validate(
        &self,
        challenge_type: ChallengeType,
        identifier: &Identifier,
        token: &str,
        thumbprint: &str,
    ) -> Result<(), ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((
            challenge_type,
            identifier.clone(),
            token.to_string(),
            thumbprint.to_string(),
        ));
        self.result.lock().unwrap().clone()
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A client account: its id and key
pub struct TestAccount {
    pub id: AccountId,
    pub key: KeyPair,
    pub thumbprint: String,
}

impl TestAccount {
    pub fn signer(&self) -> Signer {
        Signer::Kid(self.id.clone())
    }
}

pub struct Harness {
    pub config: Config,
    pub service: Arc<AcmeService>,
    pub storage: MemoryStorage,
    pub store: Arc<ResourceStore>,
    pub handle: EngineHandle,
    pub validator: Arc<MockValidator>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<AcmeMetrics>,
    engine: Option<ValidationEngine>,
    engine_task: Option<JoinHandle<()>>,
}

impl Harness {
    /// Harness with a passing validator and a running engine
    pub async fn start() -> Self {
        let mut harness =
            Self::stopped(test_config(), MemoryStorage::new(), MockValidator::passing());
        harness.run_engine();
        harness
    }

    /// Harness whose engine is built but not yet running
    pub fn stopped(config: Config, storage: MemoryStorage, validator: Arc<MockValidator>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let store = Arc::new(ResourceStore::new(Arc::new(storage.clone())));
        let metrics = Arc::new(AcmeMetrics::new().expect("metrics registry"));
        let nonces = Arc::new(NonceRegistry::new(config.nonce.ttl(), Arc::clone(&clock)));

        let engine = ValidationEngine::new(
            Arc::clone(&store),
            validator.clone(),
            (&config.validation).into(),
            Arc::clone(&clock),
        )
        .with_metrics(Arc::clone(&metrics));
        let handle = engine.handle();

        let issuer = LocalIssuer::generate(
            "Sentinel CA Test Root",
            config.orders.certificate_lifetime(),
            Arc::clone(&clock),
        )
        .expect("local issuer");
        let policies = Policies {
            identifiers: Arc::new(AllowAllIdentifiers),
            challenges: Arc::new(ConfiguredChallengeSelector::new(
                config.validation.challenge_types.clone(),
            )),
            eab: Arc::new(StoredEabPolicy::new(
                config.accounts.eab_policy,
                Arc::clone(&store),
            )),
            issuer: Arc::new(issuer),
        };

        let service = Arc::new(AcmeService::new(
            &config,
            Arc::clone(&store),
            handle.clone(),
            nonces,
            policies,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        Self {
            config,
            service,
            storage,
            store,
            handle,
            validator,
            clock,
            metrics,
            engine: Some(engine),
            engine_task: None,
        }
    }

    pub fn run_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.engine_task = Some(tokio::spawn(engine.run()));
        }
    }

    pub async fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(task) = self.engine_task.take() {
            task.await.expect("engine task");
        }
    }

    /// Register an account with a fresh key
    pub async fn new_account(&self) -> TestAccount {
        let key = KeyPair::generate().expect("account key");
        let thumbprint = format!("thumb-{}", uuid::Uuid::new_v4());
        let signer = Signer::Jwk {
            thumbprint: thumbprint.clone(),
            public_key: key.subject_public_key_info(),
        };
        let response = self
            .service
            .new_account(
                &signer,
                NewAccountRequest {
                    contact: vec!["mailto:admin@example.com".to_string()],
                    terms_of_service_agreed: true,
                    ..Default::default()
                },
            )
            .await
            .expect("account created");
        let location = response.location.expect("account location");

        TestAccount {
            id: AccountId::new(last_segment(&location)),
            key,
            thumbprint,
        }
    }

    /// Place an order for DNS names and return it with its authorizations
    pub async fn new_order(
        &self,
        account: &TestAccount,
        names: &[&str],
    ) -> (Order, Vec<Authorization>) {
        let response = self
            .service
            .new_order(
                &account.id,
                NewOrderRequest {
                    identifiers: names.iter().map(|n| Identifier::dns(*n)).collect(),
                    ..Default::default()
                },
            )
            .await
            .expect("order created");
        let location = response.location.expect("order location");
        let order = self
            .store
            .get_order(&account.id, &last_segment(&location).into())
            .await
            .expect("storage")
            .expect("order persisted");

        let mut authorizations = Vec::new();
        for id in &order.authorization_ids {
            authorizations.push(self.authorization(account, id).await);
        }
        (order, authorizations)
    }

    pub async fn authorization(
        &self,
        account: &TestAccount,
        id: &AuthorizationId,
    ) -> Authorization {
        self.store
            .get_authorization(&account.id, id)
            .await
            .expect("storage")
            .expect("authorization persisted")
    }

    /// Poll until `done` holds for the stored authorization
    pub async fn wait_for_authorization(
        &self,
        account: &TestAccount,
        id: &AuthorizationId,
        done: impl Fn(&Authorization) -> bool,
    ) -> Authorization {
        for _ in 0..1_000 {
            let authz = self.authorization(account, id).await;
            if done(&authz) {
                return authz;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("authorization {} never reached the expected state", id);
    }

    /// Wait until the validation queue has drained and no task is persisted
    pub async fn wait_for_idle(&self) {
        for _ in 0..1_000 {
            let persisted = self.store.list_task_ids().await.expect("storage");
            if persisted.is_empty() && self.handle.queue_len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("validation tasks never drained");
    }
}

/// DER CSR for `names` signed by a fresh key
pub fn csr_for(names: &[&str]) -> (Vec<u8>, KeyPair) {
    let key = KeyPair::generate().expect("csr key");
    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .expect("csr params");
    params.distinguished_name = DistinguishedName::new();
    let der = params.serialize_request(&key).expect("csr").der().to_vec();
    (der, key)
}

pub fn b64url(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(bytes)
}
