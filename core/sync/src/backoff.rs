//! Backoff schedules.
//!
//! One policy type serves the three places the engine waits before trying
//! again: failed queue items (a retry slot persisted as `next_attempt_at`),
//! feed reconnects (unbounded) and one-shot snapshot fetches (a few quick
//! attempts inside the caller's task).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use folio_common::Result;

/// Exponential delay schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth per failed attempt.
    pub factor: f64,
    /// Spread delays by +/- 25% so reconnecting clients don't align.
    pub jitter: bool,
    /// Attempts allowed by [`Backoff::retry`]. `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Backoff {
    /// Deterministic schedule for failed queue items. The retry budget is
    /// enforced by the outbox, so attempts are not capped here.
    pub fn queue(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            factor: 2.0,
            jitter: false,
            max_attempts: None,
        }
    }

    /// Jittered, unbounded schedule for feed reconnects.
    pub fn reconnect() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }

    /// Short bounded schedule derived from this one, for fetches a caller
    /// waits on.
    pub fn bounded(&self, attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..self.clone()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after `failures` previous failures (0 for the first).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }

    /// Epoch-ms slot at which an item that has failed `failures` times
    /// becomes eligible again.
    pub fn retry_at(&self, now_ms: i64, failures: u32) -> i64 {
        now_ms.saturating_add(self.delay(failures).as_millis() as i64)
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of
    /// attempts. Only transient errors are retried.
    pub async fn retry<F, Fut, T>(&self, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!("{} succeeded after {} failures", what, failures);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if self.max_attempts.is_some_and(|max| failures >= max) {
                        warn!("{} gave up after {} attempts: {}", what, failures, e);
                        return Err(e);
                    }
                    let delay = self.delay(failures - 1);
                    debug!("{} failed ({}), retrying in {:?}", what, e, delay);
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::reconnect()
    }
}
