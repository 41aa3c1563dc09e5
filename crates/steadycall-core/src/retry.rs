//! Bounded retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::deadline::Deadline;
use crate::failure::CallError;
use crate::provider::duration_ms;

/// Backoff strategy for retrying failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Doubles the delay after every failed attempt.
    ///
    /// The delay is calculated as `min(base * 2^attempt, max)`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The maximum duration to wait between retries.
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

impl Backoff {
    /// Calculate the delay after the failed attempt with 0-based index `attempt`.
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => 2_u32
                .checked_pow(attempt)
                .and_then(|scale| base.checked_mul(scale))
                .map_or(max, |delay| delay.min(max)),
        }
    }
}

/// Per-provider retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound on calls made for one provider in one run.
    /// Zero is treated as a single attempt.
    pub max_retries: u32,
    /// The backoff strategy to use between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with doubling backoff capped at `max`.
    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Create a retry policy with fixed backoff.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }

    /// A single attempt and no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Calculate the delay after the failed attempt with 0-based index `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Every delay the executor could wait through, in order.
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts().saturating_sub(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

/// Successful value plus the number of calls it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final error after the executor stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub error: CallError,
    pub attempts: u32,
}

/// Wraps one provider call and retries transient failures with backoff.
///
/// Every suspension (the call itself and each backoff sleep) is bounded by the
/// executor's [`Deadline`].
#[derive(Debug, Clone, Default)]
pub struct BackoffRetryExecutor {
    deadline: Deadline,
}

impl BackoffRetryExecutor {
    pub fn new(deadline: Deadline) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub async fn execute<T, F, Fut>(
        &self,
        mut call: F,
        policy: &RetryPolicy,
    ) -> Result<Retried<T>, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = policy.max_attempts();
        let mut attempts = 0;

        loop {
            let result = self.deadline.run(call()).await;
            attempts += 1;

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "call succeeded after retrying");
                    }
                    return Ok(Retried { value, attempts });
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                debug!(attempts, error = %error, "non-transient failure; not retrying");
                return Err(RetryFailure { error, attempts });
            }

            if attempts >= max_attempts {
                warn!(attempts, error = %error, "retry budget exhausted");
                return Err(RetryFailure { error, attempts });
            }

            let delay = policy.delay_for_attempt(attempts - 1);
            warn!(
                attempt = attempts,
                delay_ms = duration_ms(delay),
                error = %error,
                "transient failure; backing off"
            );

            if let Err(interrupted) = self.deadline.sleep(delay).await {
                return Err(RetryFailure {
                    error: interrupted,
                    attempts,
                });
            }
        }
    }
}
