//! Resilience primitives for stepwise-runtime.
//!
//! This module provides:
//! - Retry with backoff
//! - Circuit breaker to prevent cascade failures
//! - Ordered fallback chains
//!
//! None of them know about plans; the engine composes them around tool and
//! model calls.

mod circuit_breaker;
mod fallback;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use fallback::{FallbackChain, FallbackError, FallbackOutcome, StepFailure};
pub use retry::{Backoff, RetryPolicy};
