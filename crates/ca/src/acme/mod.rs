//! ACME (RFC 8555) certificate authority engine
//!
//! # Architecture
//!
//! - [`NonceRegistry`] - Single-use anti-replay nonces with lazy sweeping
//! - [`ResourceStore`] - Typed accounts, orders, authorizations and tasks over
//!   [`Storage`](crate::storage::Storage)
//! - [`ChallengeValidator`] - HTTP-01 and DNS-01 checks against the applicant's infrastructure
//! - [`ValidationEngine`] - Durable queue and bounded worker pool driving challenge validation
//! - [`AcmeService`] - Protocol operations for an external HTTP router
//! - [`tidy`] - Periodic expiry and deletion of stale state
//!
//! # Validation Flow
//!
//! 1. The client accepts a challenge; [`EngineHandle::accept`] persists a
//!    task, moves the challenge to `processing` and queues the task id
//! 2. The coordinator hands the id to a free worker
//! 3. The worker runs the validator under a per-attempt timeout
//! 4. Success marks the challenge and authorization `valid`; failure
//!    schedules a retry with linear backoff until the retry ceiling
//! 5. The client polls the authorization or order for the outcome

mod challenge;
mod clock;
mod engine;
mod error;
mod handlers;
mod issuer;
mod metrics;
mod nonce;
mod policy;
mod protocol;
mod resources;
mod store;
pub mod tidy;

pub use challenge::{
    dns01_digest, key_authorization, supports, validate_key_authorization, ChallengeValidator,
    Dns01Validator, Http01Validator, NetworkValidator, ValidationError,
};
pub use clock::{Clock, SystemClock, TokioClock};
pub use engine::{EngineError, EngineHandle, EngineSettings, Outcome, ValidationEngine};
pub use error::{AcmeError, Problem, ACME_ERROR_NS};
pub use handlers::{AcmeService, Policies};
pub use issuer::LocalIssuer;
pub use metrics::AcmeMetrics;
pub use nonce::NonceRegistry;
pub use policy::{
    AllowAllIdentifiers, AllowedDomains, CertificateIssuer, ChallengeSelector,
    ConfiguredChallengeSelector, EabPolicy, IdentifierPolicy, IssuedCertificate, StoredEabPolicy,
};
pub use protocol::{
    AccountView, AcmeResponse, AuthorizationView, ChallengeView, DeactivateAuthorizationRequest,
    Directory, DirectoryMeta, ExternalAccountBinding, FinalizeRequest, NewAccountRequest,
    NewOrderRequest, OrderListView, OrderView, RevokeRequest, Signer, UpdateAccountRequest, Urls,
};
pub use resources::{
    generate_token, Account, AccountStatus, Authorization, AuthorizationStatus,
    CertificateRecord, Challenge, ChallengeStatus, EabKey, Order, OrderStatus, ValidationTask,
};
pub use store::ResourceStore;
pub use tidy::TidyReport;
