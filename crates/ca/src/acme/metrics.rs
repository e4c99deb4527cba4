//! Prometheus metrics for the ACME engine.
//!
//! Each [`AcmeMetrics`] owns its own registry so that several services in
//! one process (tests, embedded use) never collide on metric names.

use std::fmt;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// ACME engine metrics collector
pub struct AcmeMetrics {
    registry: Registry,
    /// Nonces handed out
    nonces_issued: IntCounterVec,
    /// Protocol resources created, by kind (account, order, authorization)
    resources_created: IntCounterVec,
    /// Validation attempts, by challenge type and outcome
    validation_attempts: IntCounterVec,
    /// Tasks waiting in the queue (deferred retries included)
    queue_depth: IntGauge,
    /// Validation workers currently running
    workers_busy: IntGauge,
    /// Certificates issued or revoked, by event
    certificates: IntCounterVec,
    /// Records removed or transitioned by tidy, by resource
    tidied: IntCounterVec,
}

impl AcmeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let nonces_issued = IntCounterVec::new(
            Opts::new("sentinel_ca_nonces_issued_total", "Total nonces issued"),
            &["source"],
        )
        .context("Failed to create nonces_issued metric")?;

        let resources_created = IntCounterVec::new(
            Opts::new(
                "sentinel_ca_resources_created_total",
                "ACME resources created by kind",
            ),
            &["kind"],
        )
        .context("Failed to create resources_created metric")?;

        let validation_attempts = IntCounterVec::new(
            Opts::new(
                "sentinel_ca_validation_attempts_total",
                "Challenge validation attempts by challenge type and outcome",
            ),
            &["challenge_type", "outcome"],
        )
        .context("Failed to create validation_attempts metric")?;

        let queue_depth = IntGauge::new(
            "sentinel_ca_validation_queue_depth",
            "Validation tasks waiting for a worker",
        )
        .context("Failed to create queue_depth metric")?;

        let workers_busy = IntGauge::new(
            "sentinel_ca_validation_workers_busy",
            "Validation workers currently running",
        )
        .context("Failed to create workers_busy metric")?;

        let certificates = IntCounterVec::new(
            Opts::new(
                "sentinel_ca_certificates_total",
                "Certificate lifecycle events",
            ),
            &["event"],
        )
        .context("Failed to create certificates metric")?;

        let tidied = IntCounterVec::new(
            Opts::new(
                "sentinel_ca_tidy_records_total",
                "Records expired, revoked or deleted by tidy",
            ),
            &["resource", "action"],
        )
        .context("Failed to create tidied metric")?;

        registry
            .register(Box::new(nonces_issued.clone()))
            .context("Failed to register nonces_issued metric")?;
        registry
            .register(Box::new(resources_created.clone()))
            .context("Failed to register resources_created metric")?;
        registry
            .register(Box::new(validation_attempts.clone()))
            .context("Failed to register validation_attempts metric")?;
        registry
            .register(Box::new(queue_depth.clone()))
            .context("Failed to register queue_depth metric")?;
        registry
            .register(Box::new(workers_busy.clone()))
            .context("Failed to register workers_busy metric")?;
        registry
            .register(Box::new(certificates.clone()))
            .context("Failed to register certificates metric")?;
        registry
            .register(Box::new(tidied.clone()))
            .context("Failed to register tidied metric")?;

        Ok(Self {
            registry,
            nonces_issued,
            resources_created,
            validation_attempts,
            queue_depth,
            workers_busy,
            certificates,
            tidied,
        })
    }

    pub fn record_nonce_issued(&self, source: &str) {
        self.nonces_issued.with_label_values(&[source]).inc();
    }

    pub fn record_created(&self, kind: &str) {
        self.resources_created.with_label_values(&[kind]).inc();
    }

    pub fn record_validation(&self, challenge_type: &str, outcome: &str) {
        self.validation_attempts
            .with_label_values(&[challenge_type, outcome])
            .inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_workers_busy(&self, busy: usize) {
        self.workers_busy.set(busy as i64);
    }

    pub fn record_certificate(&self, event: &str) {
        self.certificates.with_label_values(&[event]).inc();
    }

    pub fn record_tidied(&self, resource: &str, action: &str, count: usize) {
        if count > 0 {
            self.tidied
                .with_label_values(&[resource, action])
                .inc_by(count as u64);
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn export(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }
}

impl fmt::Debug for AcmeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeMetrics")
            .field("queue_depth", &self.queue_depth.get())
            .field("workers_busy", &self.workers_busy.get())
            .finish_non_exhaustive()
    }
}
