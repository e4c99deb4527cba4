//! Wall-clock source for expiry and retry bookkeeping
//!
//! Persisted timestamps are wall-clock (`chrono`), while the engine's timers
//! run on tokio's clock. [`TokioClock`] derives wall time from tokio's clock
//! so that tests running with a paused runtime see both advance together.

use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of the current time
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time anchored at construction and advanced by tokio's clock
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            instant_anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.instant_anchor.elapsed();
        chrono::Duration::from_std(elapsed)
            .map(|d| self.wall_anchor + d)
            .unwrap_or(self.wall_anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now();

        tokio::time::advance(Duration::from_secs(3600)).await;

        let elapsed = clock.now() - before;
        assert_eq!(elapsed.num_seconds(), 3600);
    }
}
