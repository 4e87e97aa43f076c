//! Resilience patterns for provider clients
//!
//! This module provides implementations of common resilience patterns:
//! - Retry with exponential backoff
//! - Circuit breaker with a single half-open trial
//! - Unified resilience facade applying both per attempt

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerOutcome, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
};
pub use retry::{RetryExecutor, RetryPolicy};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Result, ServiceError};

/// What happened during one attempt, handed to the attempt listener
#[derive(Debug)]
pub struct AttemptReport<'a> {
    /// 1-based attempt number
    pub attempt: u32,
    /// Wall time of the attempt; zero when the breaker failed fast
    pub latency: Duration,
    /// The error, if the attempt failed
    pub error: Option<&'a ServiceError>,
    /// Whether the attempt used the half-open trial permit
    pub trial: bool,
}

/// A unified resilience facade that composes retry and circuit breaking
#[derive(Debug, Clone)]
pub struct Resilience {
    retry: RetryExecutor,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    /// Create a new resilience facade with specified configurations
    pub fn new(
        name: impl Into<String>,
        retry_policy: RetryPolicy,
        circuit_breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            retry: RetryExecutor::new(retry_policy),
            circuit_breaker: Arc::new(CircuitBreaker::new(name, circuit_breaker_config)),
        }
    }

    /// Execute an operation under the breaker, a per-attempt timeout and retry.
    ///
    /// Each attempt acquires its own breaker permit. An open breaker fails the
    /// attempt immediately without invoking `operation`; that error is not
    /// retried. Attempts made with the half-open trial permit are never
    /// retried either. `on_attempt` observes every attempt, fast-fails
    /// included.
    pub async fn execute<F, Fut, T, L>(
        &self,
        timeout: Duration,
        mut operation: F,
        on_attempt: L,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        L: Fn(AttemptReport<'_>),
    {
        let last_was_trial = AtomicBool::new(false);
        let last_was_trial = &last_was_trial;
        let on_attempt = &on_attempt;

        self.retry
            .execute_with(
                |attempt| {
                    let acquired = self
                        .circuit_breaker
                        .try_acquire()
                        .map(|permit| (permit, operation(attempt)));

                    async move {
                        let (permit, call) = match acquired {
                            Ok(acquired) => acquired,
                            Err(err) => {
                                last_was_trial.store(false, Ordering::SeqCst);
                                on_attempt(AttemptReport {
                                    attempt,
                                    latency: Duration::ZERO,
                                    error: Some(&err),
                                    trial: false,
                                });
                                return Err(err);
                            }
                        };

                        let trial = permit.is_trial();
                        last_was_trial.store(trial, Ordering::SeqCst);

                        let started = Instant::now();
                        let result = match tokio::time::timeout(timeout, call).await {
                            Ok(result) => result,
                            Err(_) => Err(ServiceError::timeout(format!(
                                "{} call exceeded {}ms",
                                self.circuit_breaker.name(),
                                timeout.as_millis()
                            ))),
                        };
                        let latency = started.elapsed();

                        permit.settle(BreakerOutcome::of(&result));
                        on_attempt(AttemptReport {
                            attempt,
                            latency,
                            error: result.as_ref().err(),
                            trial,
                        });
                        result
                    }
                },
                |err| err.is_retryable() && !last_was_trial.load(Ordering::SeqCst),
            )
            .await
    }

    /// The breaker guarding this provider
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Get the current status of the circuit breaker
    pub fn circuit_breaker_status(&self) -> CircuitBreakerStatus {
        self.circuit_breaker.status()
    }

    /// The retry policy in effect
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }
}

/// Status of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerStatus {
    /// Circuit is closed, allowing requests
    Closed,

    /// Circuit is open, rejecting requests
    Open,

    /// Circuit is half-open, allowing a single trial request
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}
