//! Per-request retry and failover bookkeeping.

use crate::config::RetryConfig;
use std::time::Duration;

/// Limits governing retries and failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempts against the same backend after the first try.
    pub max_retries: u32,
    /// Distinct backends a request may be forwarded to.
    pub max_attempts: u32,
    /// Fixed pause before each same-backend retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_attempts: config.max_attempts,
            backoff: config.backoff,
        }
    }
}

/// Counters carried through one client request.
///
/// `attempts` counts the backend currently being tried, so it starts at 1.
/// `retries` is local to that backend and resets on failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub retries: u32,
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            retries: 0,
            attempts: 1,
        }
    }

    /// Whether the current backend still has retry budget.
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        self.retries < policy.max_retries
    }

    /// Whether the request has tried as many backends as allowed.
    ///
    /// `attempts` is 1-based, so with `max_attempts = 3` this trips on the
    /// fourth selection and at most three backends are ever forwarded to.
    pub fn attempts_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempts > policy.max_attempts
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Move on to a new backend with a fresh retry budget.
    pub fn fail_over(&mut self) {
        self.attempts += 1;
        self.retries = 0;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = RetryState::new();
        assert_eq!(state.retries, 0);
        assert_eq!(state.attempts, 1);
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        let mut retries = 0;
        while state.can_retry(&policy) {
            state.record_retry();
            retries += 1;
        }
        assert_eq!(retries, 3);
    }

    #[test]
    fn test_fail_over_resets_retries() {
        let mut state = RetryState::new();
        state.record_retry();
        state.record_retry();
        state.fail_over();

        assert_eq!(state, RetryState { retries: 0, attempts: 2 });
    }

    #[test]
    fn test_attempt_boundary() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        // attempts 1, 2, 3 are allowed; 4 is not
        let mut allowed = 0;
        while !state.attempts_exhausted(&policy) {
            allowed += 1;
            state.fail_over();
        }
        assert_eq!(allowed, 3);
        assert_eq!(state.attempts, 4);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_retries: 1,
            max_attempts: 5,
            backoff: Duration::from_millis(250),
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, Duration::from_millis(250));
    }
}
