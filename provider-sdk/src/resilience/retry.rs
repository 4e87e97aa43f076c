//! Retry with exponential backoff for recoverable errors
//!
//! A reusable `RetryPolicy` consumed by the gateway. Only transient errors
//! (timeouts, rate limits, connection failures and 5xx responses) are retried.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};

use crate::error::{Result, ServiceError};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial backoff duration
    pub initial_interval: Duration,

    /// Maximum backoff duration
    pub max_interval: Duration,

    /// Multiplier for backoff between retries
    pub multiplier: f64,

    /// Jitter applied to each interval
    pub randomization_factor: f64,

    /// Maximum total time to spend retrying
    pub max_elapsed_time: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.2,
            max_elapsed_time: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_elapsed_time: self.max_elapsed_time,
            ..ExponentialBackoff::default()
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy {{ max_attempts: {}, initial_interval: {:?}, max_interval: {:?}, multiplier: {}, randomization_factor: {} }}",
            self.max_attempts,
            self.initial_interval,
            self.max_interval,
            self.multiplier,
            self.randomization_factor,
        )
    }
}

/// Executor for retry operations with exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the specified policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Execute a fallible operation, retrying retryable errors.
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(operation, |err| err.is_retryable()).await
    }

    /// Like `execute`, with a caller supplied retry predicate.
    ///
    /// The predicate is consulted after each failed attempt, once the
    /// attempt's future has completed.
    pub async fn execute_with<F, Fut, T, P>(&self, mut operation: F, should_retry: P) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&ServiceError) -> bool,
    {
        let mut backoff = self.policy.backoff();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_attempts || !should_retry(&err) {
                return if attempt > 1 {
                    Err(err.with_context_value("attempts", attempt))
                } else {
                    Err(err)
                };
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    log::warn!(
                        "Operation failed with retryable error, retrying in {:?} (attempt {}/{}): {}",
                        delay,
                        attempt,
                        max_attempts,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err.with_context_value("attempts", attempt)),
            }
        }
    }

    /// Get the current retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
