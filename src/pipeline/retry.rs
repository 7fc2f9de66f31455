//! Exponential backoff for transient failures.
//!
//! Wrap the operation value: `policy.run("fetch_page", || source.fetch_page(offset))`.
//! Non-transient errors return immediately; exhausting the attempts returns
//! the last error unchanged.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Failure classes worth retrying (timeouts, connection errors, rate limits).
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Upstream hint (e.g. `Retry-After`); used when longer than the computed delay.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: u32,
    retries: Arc<AtomicU32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2), 2)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, factor: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            factor: factor.max(1),
            retries: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1)
    }

    /// Copy of this policy with its own retry counter, so one run's
    /// statistics do not leak into another's.
    pub fn fresh(&self) -> Self {
        Self::new(self.max_attempts, self.base, self.factor)
    }

    /// `base * factor^attempt`, attempt starting at 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(self.factor.saturating_pow(attempt))
    }

    /// Retries performed through this policy (and its clones) so far.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_transient() || attempt + 1 >= self.max_attempts {
                        return Err(err);
                    }
                    let mut delay = self.delay_for(attempt);
                    if let Some(hint) = err.retry_after() {
                        if hint > delay {
                            delay = hint;
                        }
                    }
                    warn!(
                        op = label,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retrying"
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
