//! Timeout and retry policy for external calls
//!
//! Every provider (and rotation target) call is bounded by a timeout and
//! retried with exponential backoff plus jitter while its error is
//! transient.

use crate::error::Retryable;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Retry configuration for provider operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Run `call` until it succeeds, fails permanently or runs out of attempts
///
/// Each attempt is bounded by `attempt_timeout`; a timeout counts as a
/// transient failure. Returns the final result and the number of attempts
/// made.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    attempt_timeout: Duration,
    operation: &str,
    mut call: F,
) -> (Result<T, E>, u32)
where
    E: Retryable + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match timeout(attempt_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(attempt_timeout)),
        };

        match result {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = config.jittered(config.delay_for_attempt(attempt - 1));
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
