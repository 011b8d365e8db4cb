//! Bounded retry support for transient device failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times an operation is attempted in total and how long
/// to wait between attempts. Used by connection setup to ride out devices
/// that are still booting or briefly unreachable.
///
/// # Example
///
/// ```rust
/// use daq_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.attempts(), 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// A value of 0 is treated as 1: the operation always runs at least once.
    pub max_attempts: u32,

    /// Constant delay between consecutive attempts.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Effective number of attempts (never zero).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        self.delay * self.attempts().saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 500ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Every attempt permitted by a [`RetryPolicy`] failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    /// Number of attempts made.
    pub attempts: u32,
    /// Error returned by the final attempt.
    pub last_error: E,
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
///
/// `operation` receives the 1-based attempt number. The delay is applied
/// between attempts only, never after the final one.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                tracing::debug!(
                    attempt,
                    max_attempts = attempts,
                    "Attempt failed, retrying in {:?}: {}",
                    policy.delay,
                    error
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
