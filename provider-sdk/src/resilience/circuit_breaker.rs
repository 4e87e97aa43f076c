//! Circuit breaker implementation for preventing cascading failures
//!
//! One breaker guards one provider. All state lives behind a single mutex so
//! every transition is atomic with respect to concurrent callers, and the lock
//! is never held across an await point.
//!
//! Callers obtain a [`BreakerPermit`] before each provider call and settle it
//! with the outcome afterwards. A half-open breaker hands out exactly one
//! trial permit; everyone else fails fast until the trial settles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::CircuitBreakerStatus;
use crate::error::{Result, ServiceError};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive transient failures before the circuit opens
    pub failure_threshold: u32,

    /// Cooldown applied the first time the circuit opens
    pub cooldown: Duration,

    /// Upper bound for the doubled cooldown after failed trials
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

/// How a guarded call ended, as far as the breaker is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// The provider answered successfully
    Success,
    /// Timeout, rate limit, connection failure or 5xx
    TransientFailure,
    /// The provider answered, but the request was rejected
    PermanentFailure,
}

impl BreakerOutcome {
    /// Classify the result of a provider call
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => BreakerOutcome::Success,
            Err(err) if err.is_retryable() => BreakerOutcome::TransientFailure,
            Err(_) => BreakerOutcome::PermanentFailure,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant, cooldown: Duration },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Bumped on every transition; permits from older generations are stale
    generation: u64,
    next_cooldown: Duration,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
}

/// Point-in-time view of a breaker, used for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub status: CircuitBreakerStatus,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub next_cooldown_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
}

/// A thread-safe circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the specified configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed {
                    consecutive_failures: 0,
                },
                generation: 0,
                next_cooldown: config.cooldown,
                total_successes: 0,
                total_failures: 0,
                rejected: 0,
            }),
            config,
        }
    }

    /// Name of the guarded provider
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for permission to call the provider.
    ///
    /// Fails with a circuit-broken error while the breaker is open, or while a
    /// half-open trial is already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed { .. } => Ok(self.permit(inner.generation, false)),
            BreakerState::Open { opened_at, cooldown } => {
                let ready_at = opened_at + cooldown;
                if now >= ready_at {
                    inner.generation += 1;
                    inner.state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    log::info!("Circuit breaker '{}' half-open, admitting trial call", self.name);
                    Ok(self.permit(inner.generation, true))
                } else {
                    inner.rejected += 1;
                    let remaining = ready_at - now;
                    Err(ServiceError::circuit_broken(format!(
                        "Circuit breaker '{}' is open, rejecting requests for {}ms more",
                        self.name,
                        remaining.as_millis()
                    )))
                }
            }
            BreakerState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    inner.rejected += 1;
                    Err(ServiceError::circuit_broken(format!(
                        "Circuit breaker '{}' is half-open with a trial in flight",
                        self.name
                    )))
                } else {
                    inner.state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(self.permit(inner.generation, true))
                }
            }
        }
    }

    fn permit(self: &Arc<Self>, generation: u64, trial: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            generation,
            trial,
            settled: false,
        }
    }

    fn record(&self, generation: u64, trial: bool, outcome: BreakerOutcome) {
        let mut inner = self.lock();

        match outcome {
            BreakerOutcome::Success => inner.total_successes += 1,
            BreakerOutcome::TransientFailure => inner.total_failures += 1,
            BreakerOutcome::PermanentFailure => {}
        }

        if generation != inner.generation {
            log::debug!(
                "Circuit breaker '{}' ignoring stale {:?} from generation {}",
                self.name,
                outcome,
                generation
            );
            return;
        }

        match (inner.state, trial) {
            (BreakerState::Closed { consecutive_failures }, false) => match outcome {
                BreakerOutcome::Success => {
                    inner.state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
                BreakerOutcome::TransientFailure => {
                    let failures = consecutive_failures + 1;
                    if failures >= self.config.failure_threshold {
                        let cooldown = inner.next_cooldown;
                        self.open(&mut inner, cooldown);
                    } else {
                        inner.state = BreakerState::Closed {
                            consecutive_failures: failures,
                        };
                    }
                }
                BreakerOutcome::PermanentFailure => {}
            },
            (BreakerState::HalfOpen { .. }, true) => match outcome {
                BreakerOutcome::Success | BreakerOutcome::PermanentFailure => {
                    inner.generation += 1;
                    inner.next_cooldown = self.config.cooldown;
                    inner.state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                    log::info!("Circuit breaker '{}' closed after successful trial", self.name);
                }
                BreakerOutcome::TransientFailure => {
                    let cooldown = (inner.next_cooldown * 2).min(self.config.max_cooldown);
                    self.open(&mut inner, cooldown);
                }
            },
            (state, trial) => {
                log::debug!(
                    "Circuit breaker '{}' ignoring {:?} (trial: {}) in state {:?}",
                    self.name,
                    outcome,
                    trial,
                    state
                );
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner, cooldown: Duration) {
        inner.generation += 1;
        inner.next_cooldown = cooldown;
        inner.state = BreakerState::Open {
            opened_at: Instant::now(),
            cooldown,
        };
        log::warn!(
            "Circuit breaker '{}' opened for {:?}",
            self.name,
            cooldown
        );
    }

    /// Get the current circuit status
    pub fn status(&self) -> CircuitBreakerStatus {
        match self.lock().state {
            BreakerState::Closed { .. } => CircuitBreakerStatus::Closed,
            BreakerState::Open { .. } => CircuitBreakerStatus::Open,
            BreakerState::HalfOpen { .. } => CircuitBreakerStatus::HalfOpen,
        }
    }

    /// Snapshot the breaker for health reporting
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let (status, consecutive_failures, cooldown_remaining_ms) = match inner.state {
            BreakerState::Closed { consecutive_failures } => {
                (CircuitBreakerStatus::Closed, consecutive_failures, None)
            }
            BreakerState::Open { opened_at, cooldown } => {
                let remaining = (opened_at + cooldown).saturating_duration_since(Instant::now());
                (
                    CircuitBreakerStatus::Open,
                    0,
                    Some(remaining.as_millis() as u64),
                )
            }
            BreakerState::HalfOpen { .. } => (CircuitBreakerStatus::HalfOpen, 0, None),
        };

        BreakerSnapshot {
            name: self.name.clone(),
            status,
            consecutive_failures,
            cooldown_remaining_ms,
            next_cooldown_ms: inner.next_cooldown.as_millis() as u64,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
        }
    }
}

/// Permission to make one provider call.
///
/// Settle it with [`BreakerPermit::settle`]. A trial permit dropped without
/// being settled (for example because the caller was cancelled) counts as a
/// transient failure, so the breaker can never get stuck half-open.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this is the single half-open trial permit
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the outcome of the guarded call
    pub fn settle(mut self, outcome: BreakerOutcome) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, outcome);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker
                .record(self.generation, true, BreakerOutcome::TransientFailure);
        }
    }
}
