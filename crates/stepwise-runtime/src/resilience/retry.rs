//! Retry with backoff.
//!
//! A [`RetryPolicy`] is plain configuration: how many attempts and how long to
//! wait between them. Sleeping and the retry loop itself are delegated to
//! `backon`, with `tokio::time::sleep` as the sleeper so paused-time tests
//! observe every delay.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, Retryable};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry without waiting.
    Immediate,

    /// Wait the same delay before every retry.
    Fixed {
        #[serde(with = "duration")]
        delay: Duration,
    },

    /// `min(base * factor^k + U[0, jitter], max_delay)` before retry `k`.
    Exponential {
        #[serde(with = "duration")]
        base: Duration,
        factor: f64,
        #[serde(with = "duration")]
        max_delay: Duration,
        #[serde(default, with = "duration::option")]
        jitter: Option<Duration>,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Immediate
    }
}

impl Backoff {
    /// Exponential backoff without jitter.
    pub fn exponential(base: Duration, factor: f64, max_delay: Duration) -> Self {
        Self::Exponential {
            base,
            factor,
            max_delay,
            jitter: None,
        }
    }

    /// Add up to `jitter` of random delay. No effect on non-exponential schedules.
    pub fn with_jitter(self, jitter: Duration) -> Self {
        match self {
            Self::Exponential {
                base,
                factor,
                max_delay,
                ..
            } => Self::Exponential {
                base,
                factor,
                max_delay,
                jitter: Some(jitter),
            },
            other => other,
        }
    }

    /// Delay to wait after the failure of 0-based attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                base,
                factor,
                max_delay,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let scaled = base.as_secs_f64() * factor.powi(exponent);
                let spread = jitter
                    .map(|j| j.as_secs_f64() * jitter_fraction())
                    .unwrap_or(0.0);
                let secs = (scaled + spread).max(0.0).min(max_delay.as_secs_f64());

                Duration::try_from_secs_f64(secs).unwrap_or(*max_delay)
            }
        }
    }
}

/// Random bits in the low 62 of a v4 UUID; the two above are the variant.
const JITTER_MASK: u64 = (1 << 62) - 1;

/// Uniform value in `[0, 1]` taken from the random bits of a v4 UUID.
fn jitter_fraction() -> f64 {
    let bits = Uuid::new_v4().as_u128() as u64 & JITTER_MASK;
    bits as f64 / JITTER_MASK as f64
}

/// Retry configuration.
///
/// Stateless and cheap to clone; one policy may drive any number of
/// concurrent operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::Immediate,
        }
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` of 0 is treated as 1.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A policy that calls the operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Immediate)
    }

    fn schedule(&self) -> Schedule {
        Schedule {
            backoff: self.backoff.clone(),
            retries: self.max_attempts.max(1) - 1,
        }
    }

    /// Run `operation`, retrying every error.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Run `operation`, retrying only errors accepted by `retry_if`.
    ///
    /// Returns the first success, or the last error once the predicate
    /// rejects an error or attempts are exhausted.
    pub async fn execute_when<T, E, F, Fut, P>(&self, operation: F, retry_if: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: FnMut(&E) -> bool,
    {
        operation
            .retry(self.schedule())
            .sleep(tokio::time::sleep)
            .when(retry_if)
            .notify(|err: &E, delay: Duration| {
                tracing::debug!(error = %err, delay = ?delay, "Retrying after failure");
            })
            .await
    }
}

/// `backon` builder for a policy's delays.
#[derive(Debug, Clone)]
struct Schedule {
    backoff: Backoff,
    retries: u32,
}

impl BackoffBuilder for Schedule {
    type Backoff = Delays;

    fn build(self) -> Self::Backoff {
        Delays {
            backoff: self.backoff,
            attempt: 0,
            remaining: self.retries,
        }
    }
}

/// Yields one delay per remaining retry, then ends.
#[derive(Debug)]
struct Delays {
    backoff: Backoff,
    attempt: u32,
    remaining: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.backoff.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
