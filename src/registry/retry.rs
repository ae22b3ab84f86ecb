//! Bounded retries for transient backend failures.
//!
//! Every backend call the registry makes goes through [`RetryPolicy::run`]:
//! each attempt is capped by the operation timeout, transient failures are
//! retried with exponential backoff and jitter, everything else is returned
//! straight away. The attempt bound is small so callers fail closed quickly
//! when the backend is really down.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

use super::store::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    operation_timeout: Duration,
}

impl RetryPolicy {
    /// Default policy: 3 attempts, 50ms->1s exponential backoff with jitter,
    /// and a 5s timeout per attempt.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(5),
        }
    }

    /// Single attempt, no backoff.
    #[must_use]
    pub fn none() -> Self {
        Self::new().with_max_attempts(1)
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    #[must_use]
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        let operation_timeout = if self.operation_timeout.is_zero() {
            Duration::from_secs(1)
        } else {
            self.operation_timeout
        };
        Self {
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max,
            operation_timeout,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error. A timed out attempt counts as a transient
    /// failure.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run_write(operation, op).await.0
    }

    /// [`run`](Self::run) for writes that are not idempotent. The flag is
    /// set when the result came from a retry: an earlier attempt timed out
    /// or failed in flight and may have been applied, so a conflict in the
    /// result can be the caller's own write.
    pub async fn run_write<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> (Result<T, StoreError>, bool)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match timeout(self.operation_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Transient(anyhow::anyhow!(
                    "{operation} timed out after {:?}",
                    self.operation_timeout
                ))),
            };
            match result {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff_delay(attempt, self.backoff_base, self.backoff_max);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient registry failure, retrying: {err:#}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return (other, attempt > 1),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
