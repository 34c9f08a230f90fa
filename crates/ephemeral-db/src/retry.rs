//! Bounded, fixed-interval retry used by the readiness phases.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attempts made by [`RetryPolicy::default`].
pub const DEFAULT_ATTEMPTS: u32 = 1000;
/// Pause between attempts made by [`RetryPolicy::default`].
pub const DEFAULT_INTERVAL_MS: u64 = 10;

/// How many times an operation is tried and how long to wait in between.
///
/// The default budget is 1000 attempts ten milliseconds apart, roughly ten
/// seconds of wall-clock time per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    attempts: u32,
    interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given budget.
    #[must_use]
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns a copy with a different attempt count.
    #[must_use]
    pub const fn with_attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    /// Returns a copy with a different pause, in milliseconds.
    #[must_use]
    pub const fn with_interval_ms(self, interval_ms: u64) -> Self {
        Self {
            interval_ms,
            ..self
        }
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pause between consecutive attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outcome of a failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// The failure may clear up; try again after the interval.
    Transient(E),
    /// Retrying cannot help; stop immediately.
    Fatal(E),
}

/// Failure returned by [`retry`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// An attempt reported a fatal failure.
    #[error("{0}")]
    Aborted(E),
}

impl<E> RetryError<E> {
    /// Returns the underlying error regardless of how retrying ended.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::Aborted(last) => last,
        }
    }
}

/// Runs `operation` until it succeeds, fails fatally, or the policy's
/// attempts are spent.
///
/// The closure receives the one-based attempt number. The interval is slept
/// between attempts, never after the last one. A policy with zero attempts
/// still makes one attempt.
///
/// # Errors
///
/// Returns [`RetryError::Aborted`] on the first fatal failure and
/// [`RetryError::Exhausted`] with the final error once the budget runs out.
pub fn retry<T, E, F>(policy: RetryPolicy, mut operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Result<T, Attempt<E>>,
{
    let attempts = policy.attempts().max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(error)) => return Err(RetryError::Aborted(error)),
            Err(Attempt::Transient(last)) if attempt >= attempts => {
                return Err(RetryError::Exhausted { attempts, last });
            }
            Err(Attempt::Transient(_)) => {
                thread::sleep(policy.interval());
                attempt += 1;
            }
        }
    }
}
