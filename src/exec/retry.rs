//! Retry with randomized exponential backoff for transient OS errors.

use crate::error::{GhccError, Result};
use std::io;
use std::time::Duration;

/// Default number of attempts (first try plus five retries).
const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Default backoff multiplier.
const DEFAULT_MULTIPLIER: Duration = Duration::from_secs(2);

/// Default cap on a single backoff sleep.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Backoff configuration for [`retry_transient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Base of the exponential delay (`multiplier * 2^(attempt - 1)`).
    pub multiplier: Duration,
    /// Upper bound for the exponential delay before jitter.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            multiplier: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the sleep after the given (1-based) failed attempt.
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.multiplier
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered sleep after the given failed attempt, uniform in `[0, ceiling]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.ceiling_for(attempt).mul_f64(fastrand::f64())
    }
}

/// Outcome of a single attempt that did not succeed.
#[derive(Debug)]
pub enum AttemptError {
    /// OS-level failure; eligible for another attempt.
    Transient(io::Error),
    /// Terminal failure; surfaced immediately.
    Fatal(GhccError),
}

/// Run `operation` until it succeeds, fails fatally, or the policy is exhausted.
///
/// `before_sleep` is called with the number of failed attempts so far and the
/// transient error, right before backing off. When every attempt fails
/// transiently the last OS error is returned unchanged.
pub fn retry_transient<T, F, L>(
    policy: &RetryPolicy,
    mut before_sleep: L,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> std::result::Result<T, AttemptError>,
    L: FnMut(u32, &io::Error),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation() {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Transient(err)) => {
                if attempt >= max_attempts {
                    return Err(GhccError::Io(err));
                }
                before_sleep(attempt, &err);
                std::thread::sleep(policy.delay_for(attempt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn would_block() -> io::Error {
        io::Error::from(io::ErrorKind::WouldBlock)
    }

    #[test]
    fn test_succeeds_after_five_transient_errors() {
        let mut calls = 0;
        let mut logged = Vec::new();
        let result = retry_transient(
            &RetryPolicy::immediate(6),
            |attempt, _| logged.push(attempt),
            || {
                calls += 1;
                if calls <= 5 {
                    Err(AttemptError::Transient(would_block()))
                } else {
                    Ok(calls)
                }
            },
        );
        assert_eq!(result.unwrap(), 6);
        assert_eq!(calls, 6);
        assert_eq!(logged, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sixth_transient_error_is_returned() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(
            &RetryPolicy::immediate(6),
            |_, _| {},
            || {
                calls += 1;
                Err(AttemptError::Transient(io::Error::other(format!(
                    "attempt {}",
                    calls
                ))))
            },
        );
        assert_eq!(calls, 6);
        match result {
            Err(GhccError::Io(e)) => assert_eq!(e.to_string(), "attempt 6"),
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(
            &RetryPolicy::immediate(6),
            |_, _| {},
            || {
                calls += 1;
                Err(AttemptError::Fatal(GhccError::PoolClosed))
            },
        );
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(GhccError::PoolClosed)));
    }

    #[test]
    fn test_backoff_ceiling_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling_for(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling_for(2), Duration::from_secs(4));
        assert_eq!(policy.ceiling_for(3), Duration::from_secs(8));
        assert_eq!(policy.ceiling_for(5), Duration::from_secs(32));
        assert_eq!(policy.ceiling_for(6), Duration::from_secs(60));
        assert_eq!(policy.ceiling_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_is_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..=6 {
            assert!(policy.delay_for(attempt) <= policy.ceiling_for(attempt));
        }
    }
}
