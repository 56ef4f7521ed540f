//! Bounded retry with optional sleep between attempts.
//!
//! A policy answers one question: may this attempt be followed by another,
//! and after how long a pause. The runner [`retry`] owns the loop; errors
//! whose [`TransportError::is_retryable`] is false abort immediately.

use std::time::Duration;

use crate::error::{Result, TransportError};

/// Attempt budget and pacing for [`retry`].
pub trait RetryPolicy {
    /// Total attempts allowed, including the first.
    fn max_attempts(&self) -> u32;

    /// Pause inserted between a failed attempt and the next one.
    fn sleep(&self) -> Duration;
}

/// Up to `n` attempts, no sleep.
#[derive(Debug, Clone, Copy)]
pub struct CountingRetry {
    attempts: u32,
}

impl CountingRetry {
    pub fn new(attempts: u32) -> Self {
        Self { attempts }
    }
}

impl RetryPolicy for CountingRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn sleep(&self) -> Duration {
        Duration::ZERO
    }
}

/// Up to `n` attempts with a fixed sleep between them.
#[derive(Debug, Clone, Copy)]
pub struct CountingAndSleepRetry {
    attempts: u32,
    sleep: Duration,
}

impl CountingAndSleepRetry {
    pub fn new(attempts: u32, sleep_ms: u64) -> Self {
        Self {
            attempts,
            sleep: Duration::from_millis(sleep_ms),
        }
    }
}

impl RetryPolicy for CountingAndSleepRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn sleep(&self) -> Duration {
        self.sleep
    }
}

/// Run `f` under `policy`, returning its first success or the last failure.
///
/// Non-retryable errors surface immediately regardless of the remaining
/// attempt budget. `name` labels the operation in attempt logs.
pub fn retry<T, F>(name: &str, policy: &impl RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts().max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                tracing::error!(op = name, attempt, error = %e, "non-retryable failure");
                return Err(e);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        op = name,
                        attempts = attempt,
                        error = %e,
                        "giving up after exhausting retries"
                    );
                    return Err(e);
                }
                tracing::warn!(
                    op = name,
                    attempt,
                    max_attempts,
                    error = %e,
                    "attempt failed, retrying"
                );
                let pause = policy.sleep();
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
            }
        }
    }
}
