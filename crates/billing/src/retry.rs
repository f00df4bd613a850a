//! Retry policy for Square API calls
//!
//! Transport failures (connect errors, timeouts) are retried with exponential
//! backoff. HTTP error statuses are application answers and are returned on
//! the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays between attempts: base, 2*base, 4*base... capped at `max_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base_ms = (self.base_delay.as_millis() as u64).max(2);
        // ExponentialBackoff yields 2^n * factor milliseconds
        ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Run `op` under this policy
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0usize;
        RetryIf::start(
            self.delays(),
            || {
                attempt += 1;
                if attempt > 1 {
                    tracing::warn!(operation, attempt, "Retrying Square request");
                }
                op()
            },
            |e: &RemoteError| e.is_retryable(),
        )
        .await
    }
}
