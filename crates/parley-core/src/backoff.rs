//! Exponential backoff and retry.
//!
//! One algorithm serves both REST retries and transport reconnection: the
//! delay before attempt `n` (1-based) is `min(base * 2^(n-1), cap)`. Callers
//! differ only in base, cap and attempt budget.
//!
//! ```text
//! attempt:  1    2    3    4    5 ...
//! delay:    b   2b   4b   8b  16b ... (clamped to cap)
//! ```

use std::{fmt, future::Future, time::Duration};

use crate::env::Environment;

/// Capped exponential delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay.
    pub cap: Duration,
}

impl Backoff {
    /// Construct a schedule.
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Transport reconnection: 1s doubling up to 30s.
    pub const fn transport() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Delay before attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.checked_mul(1u32 << exponent).map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Retry budget plus schedule for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// REST calls made on behalf of the notification store.
    pub const fn service() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(5)),
        }
    }

    /// REST calls made on behalf of the chat store.
    pub const fn chat_store() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
        }
    }

    /// Single attempt.
    pub const fn none() -> Self {
        Self { max_retries: 0, backoff: Backoff::new(Duration::ZERO, Duration::ZERO) }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Classification of failures for retry purposes.
pub trait Retryable {
    /// Whether another attempt might succeed.
    fn is_retryable(&self) -> bool;
}

/// HTTP statuses worth retrying: timeouts, rate limiting and server errors.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Result of a retried operation. Never an early exit: the caller decides how
/// to present failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// Operation succeeded.
    Success {
        /// Returned value.
        value: T,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// Operation failed permanently or exhausted its budget.
    Failure {
        /// Last error observed.
        error: E,
        /// Attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }

    /// Whether the operation eventually succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Drop the attempt count.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Failure { error, .. } => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's budget is spent.
///
/// `operation` receives the 1-based attempt number. Only this future sleeps
/// between attempts; nothing else on the executor is delayed.
pub async fn retry_with_backoff<Env, T, E, F, Fut>(
    env: &Env,
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    Env: Environment,
    E: Retryable + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return RetryOutcome::Success { value, attempts: attempt },
            Err(error) => {
                if !error.is_retryable() {
                    tracing::debug!(attempt, %error, "not retrying");
                    return RetryOutcome::Failure { error, attempts: attempt };
                }
                if attempt > policy.max_retries {
                    tracing::warn!(attempts = attempt, %error, "retry budget exhausted");
                    return RetryOutcome::Failure { error, attempts: attempt };
                }

                let delay = policy.backoff.delay(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying");
                env.sleep(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_schedule() {
        let backoff = Backoff::transport();
        let delays: Vec<_> = (1..=7).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn service_schedule() {
        let policy = RetryPolicy::service();
        assert_eq!(policy.backoff.delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff.delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff.delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff.delay(4), Duration::from_secs(5));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn zeroth_attempt_is_base() {
        assert_eq!(Backoff::transport().delay(0), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempts_saturate_at_cap() {
        assert_eq!(Backoff::transport().delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504, 599] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [200, 400, 401, 403, 404, 409, 422] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }
}
