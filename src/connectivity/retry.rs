// =============================================================================
// Retry Executor — bounded retries with exponential backoff and jitter
// =============================================================================
//
// An operation gets `max_retries + 1` attempts. Between attempts the caller
// sleeps `backoff_base^attempt * initial_delay + secure_jitter(0..max_jitter)`.
// Errors the classifier marks as permanent end the loop immediately.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::secure_random::secure_jitter;

/// Backoff schedule and attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub initial_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            initial_delay: Duration::from_millis(1_000),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// How a failed attempt ended.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// Every attempt failed; carries the last error and the attempt count.
    Exhausted { attempts: u32, last: E },
    /// The classifier declared the error not worth retrying.
    Permanent { attempts: u32, error: E },
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: f64) -> Self {
        Self {
            max_retries,
            backoff_base,
            ..Self::default()
        }
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Deterministic part of the delay after failed attempt `attempt`
    /// (zero-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_base.powi(attempt as i32);
        let ms = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(ms.min(u64::MAX as f64) as u64)
    }

    /// Full delay including secure jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + secure_jitter(Duration::ZERO, self.max_jitter)
    }

    /// Run `op` until it succeeds, the classifier rejects its error, or the
    /// attempt budget is spent. `op` receives the zero-based attempt index.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, is_transient: C) -> Result<T, RetryOutcome<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if !is_transient(&e) => {
                    return Err(RetryOutcome::Permanent {
                        attempts: attempt + 1,
                        error: e,
                    });
                }
                Err(e) => {
                    if attempt + 1 >= attempts {
                        warn!(label, attempts, error = %e, "retries exhausted");
                        return Err(RetryOutcome::Exhausted { attempts, last: e });
                    }
                    let delay = self.delay(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
