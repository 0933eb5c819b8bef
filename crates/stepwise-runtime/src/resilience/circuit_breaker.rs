//! Circuit breaker to prevent cascade failures.
//!
//! When calls through a breaker fail repeatedly, the circuit opens and
//! subsequent calls are rejected without reaching the protected service.
//! After `reset_timeout` a single trial call is let through; its outcome
//! closes or reopens the circuit.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::duration;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before allowing a trial call
    #[serde(with = "duration")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed { failures: u32 },

    /// Calls are rejected until the reset timeout elapses
    Open { opened_at: Instant },

    /// One trial call decides whether the circuit closes
    HalfOpen { trial_in_flight: bool },
}

/// Errors from a call through the breaker.
#[derive(Error, Debug)]
pub enum CircuitError<E> {
    #[error("Circuit '{name}' is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if it ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// A single named circuit.
///
/// State lives behind one mutex that is never held across an await, so a
/// breaker can be shared freely between tasks behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    /// Create a new closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitState::Closed { failures: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the open → half-open timeout first.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        *state
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        *self.state.lock() = CircuitState::Closed { failures: 0 };
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with [`CircuitError::Open`] while the circuit is open or a
    /// half-open trial is already in flight; `operation` is not invoked then.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(|retry_after| CircuitError::Open {
            name: self.name.clone(),
            retry_after,
        })?;

        let mut guard = TrialGuard {
            breaker: self,
            armed: permit == Permit::Trial,
        };
        let result = operation().await;
        guard.armed = false;

        self.record(permit, result.is_ok());
        result.map_err(CircuitError::Operation)
    }

    fn refresh(&self, state: &mut CircuitState) {
        if let CircuitState::Open { opened_at } = *state {
            if opened_at.elapsed() >= self.config.reset_timeout {
                *state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
                tracing::info!(circuit = %self.name, "Circuit half-open, allowing trial call");
            }
        }
    }

    fn acquire(&self) -> Result<Permit, Duration> {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        match *state {
            CircuitState::Closed { .. } => Ok(Permit::Normal),
            CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                *state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Permit::Trial)
            }
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => Err(Duration::ZERO),
            CircuitState::Open { opened_at } => {
                Err(self.config.reset_timeout.saturating_sub(opened_at.elapsed()))
            }
        }
    }

    fn record(&self, permit: Permit, success: bool) {
        let mut state = self.state.lock();

        match (*state, permit) {
            (CircuitState::Closed { failures }, Permit::Normal) => {
                if success {
                    *state = CircuitState::Closed { failures: 0 };
                } else if failures + 1 >= self.config.failure_threshold.max(1) {
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        circuit = %self.name,
                        failures = failures + 1,
                        "Circuit opened after repeated failures"
                    );
                } else {
                    *state = CircuitState::Closed {
                        failures: failures + 1,
                    };
                }
            }
            (CircuitState::HalfOpen { .. }, Permit::Trial) => {
                if success {
                    *state = CircuitState::Closed { failures: 0 };
                    tracing::info!(circuit = %self.name, "Circuit closed after successful trial call");
                } else {
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(circuit = %self.name, "Circuit reopened after failed trial call");
                }
            }
            // Outcome of a call admitted before the last transition.
            _ => {}
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Releases the half-open slot if a trial call is dropped before finishing.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.breaker.state.lock();
        if let CircuitState::HalfOpen {
            trial_in_flight: true,
        } = *state
        {
            *state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
            tracing::debug!(circuit = %self.breaker.name, "Trial call abandoned, slot released");
        }
    }
}
