//! Retry policy for chunk uploads.
//!
//! Only idempotent chunk PATCHes are retried. Retryable outcomes are HTTP
//! 408, 429, and 5xx, plus transport-level failures. Back-off is
//! exponential with jitter, bounded by the policy's wait limits.

use std::time::Duration;

use kitforge_core::KitError;
use rand::Rng;

/// Outcome of one request attempt, as seen by the retry policy.
pub enum Attempt<'a> {
    Status(u16),
    Error(&'a KitError),
}

/// Bounds for retrying transient chunk-upload failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Lower bound for the back-off delay.
    pub min_wait: Duration,
    /// Upper bound for the back-off delay.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            min_wait: Duration::from_millis(200),
            max_wait: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Whether an HTTP status is worth retrying.
    pub fn retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429) || status >= 500
    }

    /// Decide the delay before the next attempt, or `None` when the outcome
    /// is terminal (non-retryable or out of retries).
    pub fn next_delay(&self, attempt: u32, outcome: Attempt<'_>) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let retryable = match outcome {
            Attempt::Status(status) => Self::retryable_status(status),
            Attempt::Error(err) => err.is_retryable(),
        };
        if !retryable {
            return None;
        }
        Some(self.backoff(attempt))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .min_wait
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_wait)
            .max(self.min_wait);
        let jitter: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
        let jittered = (exp.as_millis() as f64 * jitter).round() as u64;
        Duration::from_millis(jittered.max(10))
    }
}
