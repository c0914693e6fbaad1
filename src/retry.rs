use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fixed-delay retry policy: `retries` extra attempts after the first one,
/// always waiting `retry_delay` in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
    #[error("failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Result of a retried operation together with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub attempts: u32,
    pub result: Result<T, RetryError>,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation` until it succeeds or the policy is exhausted.
    ///
    /// `operation` gets the 1-based attempt number. Cancelling `ctx` stops
    /// further attempts and interrupts the wait between attempts; a running
    /// attempt is never interrupted.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if ctx.is_cancelled() {
                return RetryOutcome {
                    attempts: attempt - 1,
                    result: Err(RetryError::Cancelled { attempts: attempt - 1 }),
                };
            }

            debug!(task = %task_name, attempt, max_attempts, "starting attempt");
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(e) => {
                    warn!(task = %task_name, attempt, max_attempts, error = %e, "attempt failed");
                    last_error = format!("{e:#}");
                }
            }

            if attempt == max_attempts {
                break;
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    return RetryOutcome {
                        attempts: attempt,
                        result: Err(RetryError::Cancelled { attempts: attempt }),
                    };
                }
                _ = sleep(self.policy.retry_delay) => {}
            }
        }

        RetryOutcome {
            attempts: max_attempts,
            result: Err(RetryError::Exhausted {
                attempts: max_attempts,
                last_error,
            }),
        }
    }
}
