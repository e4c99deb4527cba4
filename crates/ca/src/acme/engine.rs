//! Challenge validation engine
//!
//! A durable, bounded worker pool driving challenges from `processing` to
//! `valid` or `invalid`. Every accepted challenge is persisted as a
//! [`ValidationTask`] before its id enters the in-memory queue, so the queue
//! can always be rebuilt from storage with
//! [`EngineHandle::reload_from_storage`].
//!
//! The [`ValidationEngine`] is owned by a single coordinating task
//! ([`ValidationEngine::run`]). Other components only talk to it through an
//! [`EngineHandle`]: enqueue work, accept challenges, request shutdown.
//!
//! # Scheduling
//!
//! - Task ids are popped from the FIFO queue under its mutex, and an id
//!   already being worked on is never dispatched twice.
//! - At most `workers` validations run at once; a finished worker wakes the
//!   coordinator through its join handle.
//! - Failed attempts are parked in a timer heap until their `retryAfter`
//!   and then appended to the back of the queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use sentinel_ca_common::{AuthorizationId, ChallengeType};
use sentinel_ca_config::{ExhaustionPolicy, ValidationConfig};

use super::challenge::{supports, ChallengeValidator, ValidationError};
use super::clock::Clock;
use super::error::AcmeError;
use super::metrics::AcmeMetrics;
use super::resources::{
    Account, Authorization, AuthorizationStatus, ChallengeStatus, ValidationTask,
};
use super::store::ResourceStore;
use crate::storage::StorageError;

// ============================================================================
// Settings
// ============================================================================

/// Engine tuning, normally taken from the `validation` config block
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum concurrent validation attempts
    pub workers: usize,
    /// Failed retries allowed before the task is given up
    pub max_retries: u32,
    /// Linear backoff step: the k-th retry waits `k * retry_backoff`
    pub retry_backoff: Duration,
    /// Upper bound on a single validator call
    pub attempt_timeout: Duration,
    /// How long a freshly validated authorization stays valid
    pub authorization_lifetime: Duration,
    pub on_exhaustion: ExhaustionPolicy,
}

impl From<&ValidationConfig> for EngineSettings {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            attempt_timeout: config.attempt_timeout(),
            authorization_lifetime: config.authorization_lifetime(),
            on_exhaustion: config.on_exhaustion,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&ValidationConfig::default())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a validation attempt did not complete the task
#[derive(Debug, Error)]
pub enum EngineError {
    /// The attempt failed and the task is scheduled for another try
    #[error("validation attempt {retry_count} failed, retrying after {retry_after}: {source}")]
    Retryable {
        retry_count: u32,
        retry_after: DateTime<Utc>,
        #[source]
        source: ValidationError,
    },

    /// The task can never succeed; it has been dropped
    #[error("validation task abandoned: {0}")]
    Fatal(String),

    /// Retries ran out; the task has been dropped
    #[error("validation gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ValidationError,
    },

    /// The task record could not be removed after a terminal outcome
    #[error("failed to delete validation task {task_id}: {source}")]
    CleanupFailed {
        task_id: String,
        #[source]
        source: StorageError,
        /// Outcome that triggered the cleanup, if it was itself an error
        original: Option<Box<EngineError>>,
    },

    #[error("storage error during validation: {0}")]
    Storage(#[from] StorageError),
}

/// Non-error worker results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Challenge and authorization are now valid
    Validated,
    /// No task record; something else already resolved it
    AlreadyResolved,
    /// The authorization left `pending`; task dropped
    Superseded,
    /// Woken before `retryAfter`
    Deferred { retry_after: DateTime<Utc> },
}

// ============================================================================
// Shared Queue
// ============================================================================

struct Shared {
    queue: Mutex<VecDeque<String>>,
    wake_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    /// Append `task_id` unless it is already queued
    fn enqueue(&self, task_id: String) -> bool {
        let mut queue = self.queue.lock();
        if queue.iter().any(|queued| *queued == task_id) {
            return false;
        }
        queue.push_back(task_id);
        true
    }

    /// Pop the next id that is not already being worked on
    fn pop_next(&self, in_flight: &HashSet<String>) -> Option<String> {
        let mut queue = self.queue.lock();
        while let Some(task_id) = queue.pop_front() {
            if in_flight.contains(&task_id) {
                trace!(task_id = %task_id, "Skipping queued task that is already in flight");
                continue;
            }
            return Some(task_id);
        }
        None
    }

    /// Single-slot signal: a wake-up while one is pending is dropped
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Entry points into a running (or not yet started) engine
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    store: Arc<ResourceStore>,
    clock: Arc<dyn Clock>,
}

impl EngineHandle {
    /// Accept a challenge for validation.
    ///
    /// Persists a task, moves the challenge to `processing` and queues the
    /// task. Accepting a challenge that already has a task is a no-op that
    /// returns the current authorization.
    pub async fn accept(
        &self,
        account: &Account,
        authorization_id: &AuthorizationId,
        challenge_type: ChallengeType,
    ) -> Result<Authorization, AcmeError> {
        let mut authz = self
            .store
            .get_authorization(&account.id, authorization_id)
            .await?
            .ok_or_else(|| AcmeError::NotFound(format!("authorization {}", authorization_id)))?;

        let task_id = ValidationTask::task_id(authorization_id, challenge_type);
        if self.store.get_task(&task_id).await?.is_some() {
            debug!(task_id = %task_id, "Challenge already accepted");
            return Ok(authz);
        }

        if authz.status != AuthorizationStatus::Pending {
            return Err(AcmeError::Malformed(format!(
                "authorization is {}, challenges can only be accepted while pending",
                authz.status
            )));
        }

        let challenge = authz.challenge(challenge_type).ok_or_else(|| {
            AcmeError::NotFound(format!(
                "challenge {} of authorization {}",
                challenge_type, authorization_id
            ))
        })?;
        if !matches!(
            challenge.status,
            ChallengeStatus::Pending | ChallengeStatus::Processing
        ) {
            return Err(AcmeError::Malformed(format!(
                "challenge is {}, only pending challenges can be accepted",
                challenge.status
            )));
        }

        let task = ValidationTask {
            account_id: account.id.clone(),
            authorization_id: authorization_id.clone(),
            challenge_type,
            token: challenge.token.clone(),
            key_thumbprint: account.key_thumbprint.clone(),
            initiated_at: self.clock.now(),
            first_validation_at: None,
            retry_count: 0,
            last_retry_at: None,
            retry_after: None,
        };
        self.store.put_task(&task).await?;

        if let Some(challenge) = authz.challenge_mut(challenge_type) {
            challenge.status = ChallengeStatus::Processing;
        }
        if let Err(e) = self.store.put_authorization(&authz).await {
            if let Err(cleanup) = self.store.delete_task(&task_id).await {
                warn!(
                    task_id = %task_id,
                    error = %cleanup,
                    "Failed to remove task after authorization write failed"
                );
            }
            return Err(e.into());
        }

        info!(
            account_id = %account.id,
            authorization_id = %authorization_id,
            challenge_type = %challenge_type,
            "Challenge accepted for validation"
        );

        self.enqueue(task_id);
        Ok(authz)
    }

    /// Queue a task id and wake the coordinator. Returns false if the id
    /// was already queued.
    pub fn enqueue(&self, task_id: impl Into<String>) -> bool {
        let added = self.shared.enqueue(task_id.into());
        self.shared.wake();
        added
    }

    /// Rebuild the queue from persisted tasks. Returns the number of ids
    /// newly queued.
    pub async fn reload_from_storage(&self) -> Result<usize, StorageError> {
        let task_ids = self.store.list_task_ids().await?;
        let total = task_ids.len();
        let added = task_ids
            .into_iter()
            .filter(|task_id| self.shared.enqueue(task_id.clone()))
            .count();
        self.shared.wake();

        info!(persisted = total, queued = added, "Reloaded validation queue from storage");
        Ok(added)
    }

    /// Ask the coordinator to stop dispatching. In-flight attempts finish.
    pub fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);
    }

    /// Drop a task id from the in-memory queue. Returns whether it was
    /// queued.
    pub fn forget(&self, task_id: &str) -> bool {
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|queued| queued != task_id);
        queue.len() != before
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_queued(&self, task_id: &str) -> bool {
        self.shared.queue.lock().iter().any(|queued| queued == task_id)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Everything a validation attempt needs; shared by all workers
struct Worker {
    store: Arc<ResourceStore>,
    validator: Arc<dyn ChallengeValidator>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<AcmeMetrics>>,
}

impl Worker {
    /// One validation attempt for `task_id`
    async fn verify(&self, task_id: &str) -> Result<Outcome, EngineError> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Ok(Outcome::AlreadyResolved);
        };

        let now = self.clock.now();
        if let Some(retry_after) = task.retry_after.filter(|after| now < *after) {
            return Ok(Outcome::Deferred { retry_after });
        }

        let authz = self
            .store
            .get_authorization(&task.account_id, &task.authorization_id)
            .await?;
        let mut authz = match authz {
            Some(authz) if authz.status == AuthorizationStatus::Pending => authz,
            other => {
                debug!(
                    task_id = %task_id,
                    status = ?other.map(|a| a.status),
                    "Authorization no longer pending, dropping task"
                );
                self.cleanup(task_id).await?;
                return Ok(Outcome::Superseded);
            }
        };

        let challenge_type = task.challenge_type;
        let problem = match authz.challenge(challenge_type) {
            None => Some(format!("authorization has no {} challenge", challenge_type)),
            Some(c) if c.status != ChallengeStatus::Processing => Some(format!(
                "{} challenge is {}, expected processing",
                challenge_type, c.status
            )),
            Some(c) if c.token != task.token => {
                Some(format!("{} challenge token does not match task", challenge_type))
            }
            Some(_) => None,
        };
        if let Some(message) = problem {
            self.record(challenge_type, "fatal");
            return Err(self.abandon(task_id, EngineError::Fatal(message)).await);
        }

        if !supports(challenge_type, &authz.identifier, authz.wildcard) {
            let error = ValidationError::Unsupported(format!(
                "{} cannot validate {}{}",
                challenge_type,
                if authz.wildcard { "wildcard " } else { "" },
                authz.identifier
            ));
            return self.give_up(task_id, &mut authz, challenge_type, error, 1).await;
        }

        trace!(
            task_id = %task_id,
            identifier = %authz.identifier,
            retry_count = task.retry_count,
            "Validating challenge"
        );

        let attempt = tokio::time::timeout(
            self.settings.attempt_timeout,
            self.validator.validate(
                challenge_type,
                &authz.identifier,
                &task.token,
                &task.key_thumbprint,
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ValidationError::Connection {
                target: authz.identifier.value.clone(),
                message: format!(
                    "attempt timed out after {}s",
                    self.settings.attempt_timeout.as_secs()
                ),
            })
        });

        // the authorization may have been deactivated while the attempt ran
        let current = self
            .store
            .get_authorization(&task.account_id, &task.authorization_id)
            .await?;
        let Some(mut authz) = current.filter(|a| a.status == AuthorizationStatus::Pending) else {
            debug!(task_id = %task_id, "Authorization resolved during attempt, dropping task");
            self.cleanup(task_id).await?;
            return Ok(Outcome::Superseded);
        };

        let now = self.clock.now();
        match attempt {
            Ok(()) => {
                let lifetime = chrono::Duration::from_std(self.settings.authorization_lifetime)
                    .unwrap_or_else(|_| chrono::Duration::days(15));
                authz.mark_valid(challenge_type, now, now + lifetime);
                self.store.put_authorization(&authz).await?;
                self.cleanup(task_id).await?;
                self.record(challenge_type, "valid");

                info!(
                    authorization_id = %authz.id,
                    identifier = %authz.identifier,
                    challenge_type = %challenge_type,
                    expires = %authz.expires,
                    "Challenge validated"
                );
                Ok(Outcome::Validated)
            }
            Err(error) if !error.is_retryable() => {
                self.give_up(task_id, &mut authz, challenge_type, error, task.retry_count + 1)
                    .await
            }
            Err(error) if task.retry_count >= self.settings.max_retries => {
                self.give_up(task_id, &mut authz, challenge_type, error, task.retry_count + 1)
                    .await
            }
            Err(error) => {
                if task.first_validation_at.is_none() {
                    task.first_validation_at = Some(now);
                }
                task.record_failure(now, self.settings.retry_backoff);
                self.store.put_task(&task).await?;
                self.record(challenge_type, "retry");

                Err(EngineError::Retryable {
                    retry_count: task.retry_count,
                    retry_after: task.retry_after.unwrap_or(now),
                    source: error,
                })
            }
        }
    }

    /// Terminal failure: apply the exhaustion policy and drop the task
    async fn give_up(
        &self,
        task_id: &str,
        authz: &mut Authorization,
        challenge_type: ChallengeType,
        error: ValidationError,
        attempts: u32,
    ) -> Result<Outcome, EngineError> {
        if self.settings.on_exhaustion == ExhaustionPolicy::Invalidate {
            authz.mark_invalid(challenge_type, error.problem());
            self.store.put_authorization(authz).await?;
        }

        let failure = if error.is_retryable() {
            self.record(challenge_type, "exhausted");
            EngineError::Exhausted {
                attempts,
                source: error,
            }
        } else {
            self.record(challenge_type, "fatal");
            EngineError::Fatal(error.to_string())
        };
        Err(self.abandon(task_id, failure).await)
    }

    /// Delete the task after a terminal error, wrapping the error if the
    /// delete fails too
    async fn abandon(&self, task_id: &str, error: EngineError) -> EngineError {
        match self.store.delete_task(task_id).await {
            Ok(()) => error,
            Err(source) => EngineError::CleanupFailed {
                task_id: task_id.to_string(),
                source,
                original: Some(Box::new(error)),
            },
        }
    }

    async fn cleanup(&self, task_id: &str) -> Result<(), EngineError> {
        self.store
            .delete_task(task_id)
            .await
            .map_err(|source| EngineError::CleanupFailed {
                task_id: task_id.to_string(),
                source,
                original: None,
            })
    }

    fn record(&self, challenge_type: ChallengeType, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_validation(challenge_type.as_str(), outcome);
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

type WorkerResult = (String, Result<Outcome, EngineError>);

/// The validation engine; consumed by [`ValidationEngine::run`]
pub struct ValidationEngine {
    worker: Worker,
    shared: Arc<Shared>,
    wake_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ValidationEngine {
    pub fn new(
        store: Arc<ResourceStore>,
        validator: Arc<dyn ChallengeValidator>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            worker: Worker {
                store,
                validator,
                settings,
                clock,
                metrics: None,
            },
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                wake_tx,
                shutdown_tx,
            }),
            wake_rx,
            shutdown_rx,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AcmeMetrics>) -> Self {
        self.worker.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
            store: Arc::clone(&self.worker.store),
            clock: Arc::clone(&self.worker.clock),
        }
    }

    /// Run the coordinator until [`EngineHandle::shutdown`] is called.
    ///
    /// After shutdown no new attempts start; running attempts are awaited.
    /// Deferred retries stay persisted and are picked up by the next
    /// [`EngineHandle::reload_from_storage`].
    pub async fn run(self) {
        let ValidationEngine {
            worker,
            shared,
            mut wake_rx,
            mut shutdown_rx,
        } = self;
        let worker = Arc::new(worker);
        let capacity = worker.settings.workers;

        info!(
            workers = capacity,
            max_retries = worker.settings.max_retries,
            retry_backoff_secs = worker.settings.retry_backoff.as_secs(),
            on_exhaustion = ?worker.settings.on_exhaustion,
            "Starting validation engine"
        );

        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut deferred: BinaryHeap<Reverse<(Instant, String)>> = BinaryHeap::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            release_due(&shared, &mut deferred);

            while workers.len() < capacity {
                let Some(task_id) = shared.pop_next(&in_flight) else {
                    break;
                };
                in_flight.insert(task_id.clone());
                spawn_attempt(&mut workers, Arc::clone(&worker), task_id);
            }

            if let Some(metrics) = &worker.metrics {
                metrics.set_queue_depth(shared.queue.lock().len() + deferred.len());
                metrics.set_workers_busy(workers.len());
            }

            let next_due = deferred.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = wake_rx.recv() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((task_id, result)) => {
                            in_flight.remove(&task_id);
                            if let Some(at) = handle_result(&worker, &task_id, result) {
                                deferred.push(Reverse((at, task_id)));
                            }
                        }
                        Err(e) => error!(error = %e, "Validation worker task failed"),
                    }
                }
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() => {}
            }
        }

        info!(
            in_flight = workers.len(),
            queued = shared.queue.lock().len(),
            deferred = deferred.len(),
            "Validation engine stopping, waiting for in-flight attempts"
        );

        while let Some(joined) = workers.join_next().await {
            if let Ok((task_id, result)) = joined {
                handle_result(&worker, &task_id, result);
            }
        }

        info!("Validation engine stopped");
    }
}

impl fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationEngine")
            .field("settings", &self.worker.settings)
            .field("queue_len", &self.shared.queue.lock().len())
            .finish_non_exhaustive()
    }
}

/// Run one attempt in its own task so a panicking validator still reports
/// back which task it was working on
fn spawn_attempt(workers: &mut JoinSet<WorkerResult>, worker: Arc<Worker>, task_id: String) {
    workers.spawn(async move {
        let id = task_id.clone();
        let result = match tokio::spawn(async move { worker.verify(&id).await }).await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Fatal(format!("validation attempt aborted: {}", e))),
        };
        (task_id, result)
    });
}

/// Move due retries to the back of the queue
fn release_due(shared: &Shared, deferred: &mut BinaryHeap<Reverse<(Instant, String)>>) {
    let now = Instant::now();
    while let Some(Reverse((at, _))) = deferred.peek() {
        if *at > now {
            break;
        }
        if let Some(Reverse((_, task_id))) = deferred.pop() {
            shared.enqueue(task_id);
        }
    }
}

/// Log a worker result; returns when the task should be retried
fn handle_result(
    worker: &Worker,
    task_id: &str,
    result: Result<Outcome, EngineError>,
) -> Option<Instant> {
    let retry_step = Instant::now() + worker.settings.retry_backoff;

    match result {
        Ok(Outcome::Validated) => {
            debug!(task_id = %task_id, "Validation task completed");
            None
        }
        Ok(Outcome::AlreadyResolved) | Ok(Outcome::Superseded) => {
            debug!(task_id = %task_id, "Validation task resolved elsewhere");
            None
        }
        Ok(Outcome::Deferred { retry_after }) => {
            debug!(task_id = %task_id, retry_after = %retry_after, "Validation task woken early");
            Some(instant_at(worker, retry_after))
        }
        Err(EngineError::Retryable {
            retry_count,
            retry_after,
            source,
        }) => {
            warn!(
                task_id = %task_id,
                retry_count = retry_count,
                retry_after = %retry_after,
                error = %source,
                "Challenge validation failed, will retry"
            );
            Some(instant_at(worker, retry_after))
        }
        Err(EngineError::Storage(e)) => {
            warn!(task_id = %task_id, error = %e, "Storage error during validation, will retry");
            Some(retry_step)
        }
        Err(e @ EngineError::CleanupFailed { .. }) => {
            error!(
                task_id = %task_id,
                error = %e,
                original = ?cleanup_original(&e),
                "Failed to clean up validation task"
            );
            Some(retry_step)
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Challenge validation abandoned");
            None
        }
    }
}

fn cleanup_original(error: &EngineError) -> Option<String> {
    match error {
        EngineError::CleanupFailed {
            original: Some(original),
            ..
        } => Some(original.to_string()),
        _ => None,
    }
}

/// Longest a parked task sleeps before its deadline is checked again
const MAX_TIMER_WAIT: Duration = Duration::from_secs(86_400);

/// Convert a wall-clock deadline to a timer instant
fn instant_at(worker: &Worker, at: DateTime<Utc>) -> Instant {
    let wait = at
        .signed_duration_since(worker.clock.now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_TIMER_WAIT);
    Instant::now() + wait
}
