//! Retry Policy: exponential backoff with jitter, capped attempt count, and
//! transient/permanent classification (spec §4.3).

use std::time::Duration;

use rand::Rng;

use crate::config::CrawlerConfig;
use crate::error::{FetchFailure, RetryExhausted};

/// Exponential backoff with jitter, bounded `[backoff_min, backoff_max]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_min_seconds: f64,
    pub backoff_max_seconds: f64,
    pub backoff_multiplier: f64,
    pub jitter_seconds: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_min_seconds: config.backoff_min_seconds,
            backoff_max_seconds: config.backoff_max_seconds,
            backoff_multiplier: config.backoff_multiplier,
            jitter_seconds: config.jitter_seconds,
        }
    }

    /// `max_retries` is the maximum number of *attempts*, not extra retries;
    /// `0` is treated as `1` (at least one try) matching spec §4.3 and the
    /// boundary behavior in §8 ("`max_retries = 0`: first failure ⇒ error
    /// immediately" — i.e. there is exactly one attempt, which then fails).
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Backoff duration before attempt number `attempt` (1-indexed), the
    /// exponential term clamped to `backoff_max_seconds` plus a uniform
    /// jitter draw in `[0, jitter_seconds]` so concurrent workers retrying
    /// the same host desynchronize.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_min_seconds
            .max(0.0)
            .min(self.backoff_max_seconds.max(self.backoff_min_seconds))
            * self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let bounded = exp.min(self.backoff_max_seconds.max(self.backoff_min_seconds));
        let jitter = if self.jitter_seconds > 0.0 {
            rand::rng().random_range(0.0..=self.jitter_seconds)
        } else {
            0.0
        };
        Duration::from_secs_f64((bounded + jitter).max(0.0))
    }

    /// Single backoff quantum used by the queue on an unclassified failure
    /// (spec §4.3 item 2): the minimum configured backoff.
    pub fn queue_backoff_seconds(&self) -> f64 {
        self.backoff_min_seconds.max(0.0)
    }
}

/// Runs `operation` under the policy, sleeping between attempts, retrying
/// only on [`FetchFailure::Transient`]. Returns `Ok(T)` on success or
/// [`RetryExhausted`] once `effective_max_attempts()` attempts have failed
/// (including the case where the final attempt was a permanent failure,
/// which is surfaced as exhaustion after a single attempt since permanent
/// errors are not retried).
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, FetchFailure>>,
{
    let max_attempts = policy.effective_max_attempts();
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(FetchFailure::Permanent(msg)) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: msg,
                    permanent: true,
                });
            }
            Err(FetchFailure::Transient(msg)) => {
                last_error = msg;
                if attempt < max_attempts {
                    tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                }
            }
        }
    }
    Err(RetryExhausted {
        attempts: max_attempts,
        last_error,
        permanent: false,
    })
}
