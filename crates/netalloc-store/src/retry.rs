//! Bounded retry of transactions that lost a commit race.
//!
//! Optimistic commits fail with a conflict when another transaction wrote
//! the same pool row first. Re-running the whole transaction against the
//! new state is always safe, so callers wrap each attempt in
//! [`RetryPolicy::run`].

use crate::StoreError;
use tracing::{debug, warn};

/// Errors that can tell whether re-running the operation may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}

/// How many times a conflicting transaction is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Default number of attempts.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Creates a policy; zero is treated as one attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error,
    /// or the attempts are used up. The last error is returned.
    pub fn run<T, E, F>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Ok(value) => {
                    if tries > 1 {
                        debug!(operation, tries, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && tries < self.max_attempts => {
                    warn!(operation, tries, error = %e, "Retrying after commit conflict");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retries_conflicts_until_success() {
        let policy = RetryPolicy::new(3);
        let mut calls = 0;
        let result: Result<u32, StoreError> = policy.run("test", || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::conflict("t", "k"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2);
        let mut calls = 0;
        let result: Result<(), StoreError> = policy.run("test", || {
            calls += 1;
            Err(StoreError::conflict("t", "k"))
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<(), StoreError> = policy.run("test", || {
            calls += 1;
            Err(StoreError::not_found("t", "k"))
        });
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
    }
}
