//! Bounded exponential backoff for calls that leave the process.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable: Sized {
    /// Returns `true` for transient failures.
    fn is_retryable(&self) -> bool;

    /// Error produced when a single attempt outlives the call timeout.
    fn timed_out(operation: &str, after: Duration) -> Self;

    /// Wraps the final error once attempts run out.
    #[must_use]
    fn exhausted(self, operation: &str, attempts: u32) -> Self;
}

/// Attempt budget and backoff shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after each failure.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Deadline for each attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Returns a policy that makes exactly one attempt.
    #[must_use]
    pub const fn single_attempt(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Each attempt is bounded by `call_timeout`.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last retryable error
    /// wrapped by [`Retryable::exhausted`].
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(operation, self.call_timeout)),
            };
            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            if attempt >= attempts {
                warn!(operation, attempts, error = %failure, "giving up after retries");
                return Err(failure.exhausted(operation, attempts));
            }
            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt,
                delay = ?delay,
                error = %failure,
                "transient failure; retrying"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Converts a duration to whole milliseconds for error messages.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
