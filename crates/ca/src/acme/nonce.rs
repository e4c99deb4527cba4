//! Replay-nonce registry
//!
//! An expiring set of single-use tokens. Issue and redeem touch one map
//! entry each; the soonest-known expiry is kept in an atomic watermark so
//! that cleanup can be triggered lazily from the request path instead of by
//! a dedicated timer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use tracing::{debug, trace};

use super::clock::Clock;

/// Random bytes per nonce (128 bits)
const NONCE_BYTES: usize = 16;

/// Concurrency-safe registry of outstanding nonces
#[derive(Debug)]
pub struct NonceRegistry {
    /// nonce -> expiry (unix millis)
    entries: DashMap<String, i64>,
    /// Soonest expiry among entries, in unix millis
    watermark: AtomicI64,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl NonceRegistry {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let registry = Self {
            entries: DashMap::new(),
            watermark: AtomicI64::new(0),
            ttl,
            clock,
        };
        registry
            .watermark
            .store(registry.fresh_expiry(), Ordering::SeqCst);
        registry
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn fresh_expiry(&self) -> i64 {
        self.now_millis()
            .saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Issue a new nonce valid for the configured TTL
    pub fn issue(&self) -> (String, DateTime<Utc>) {
        let mut bytes = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);

        let expires = self.fresh_expiry();
        self.entries.insert(nonce.clone(), expires);
        self.watermark.fetch_min(expires, Ordering::SeqCst);

        trace!(outstanding = self.entries.len(), "Issued nonce");
        let expires_at = DateTime::from_timestamp_millis(expires).unwrap_or_else(Utc::now);
        (nonce, expires_at)
    }

    /// Consume a nonce. Returns `false` if it is unknown, already used or
    /// past its expiry, whether or not a sweep has removed it yet.
    pub fn redeem(&self, nonce: &str) -> bool {
        match self.entries.remove(nonce) {
            Some((_, expires)) => self.now_millis() <= expires,
            None => false,
        }
    }

    /// Remove expired entries and recompute the watermark.
    ///
    /// Returns the number of entries removed.
    pub fn tidy(&self) -> usize {
        let now = self.now_millis();

        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| *entry.value() < now)
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|nonce| {
                self.entries
                    .remove_if(nonce.as_str(), |_, expires| *expires < now)
                    .is_some()
            })
            .count();

        let next = self
            .entries
            .iter()
            .map(|entry| *entry.value())
            .min()
            .unwrap_or_else(|| self.fresh_expiry());
        self.watermark.store(next, Ordering::SeqCst);

        if removed > 0 {
            debug!(
                removed = removed,
                outstanding = self.entries.len(),
                "Swept expired nonces"
            );
        }
        removed
    }

    /// Run [`tidy`](Self::tidy) only once the watermark has passed.
    ///
    /// Returns whether a sweep happened.
    pub fn maybe_tidy(&self) -> bool {
        if self.now_millis() < self.watermark.load(Ordering::SeqCst) {
            return false;
        }
        self.tidy();
        true
    }

    /// Number of outstanding (possibly expired) nonces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
