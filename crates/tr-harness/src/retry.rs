use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure of an operation run through [`retry_with_backoff`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the error from the final attempt.
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    /// Shutdown was signalled while waiting between attempts.
    #[error("{operation} cancelled by shutdown")]
    Cancelled { operation: String },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the `failed_attempt`-th failure (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run `f` until it succeeds or the policy is exhausted.
///
/// `f` receives the 1-based attempt number. When `shutdown` is given, the
/// wait between attempts is abandoned as soon as shutdown is triggered.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    shutdown: Option<&ShutdownSignal>,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(operation, attempts = attempt, error = %e, "giving up");
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                match shutdown {
                    Some(signal) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = signal.cancelled() => {
                                return Err(RetryError::Cancelled {
                                    operation: operation.to_string(),
                                });
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
                attempt += 1;
            }
        }
    }
}
