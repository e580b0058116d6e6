/// Bounded retry bookkeeping for the login flow.
///
/// `RetryBudget` counts automatic retries for the current login attempt.
/// It lives in the session and is cleared on success or reset, so retries
/// never accumulate across attempts. `RetryPolicy` pairs the budget size
/// with the delay to wait before a retry.
use std::time::Duration;

use crate::config::TimeoutConfig;

#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            used: 0,
        }
    }

    /// Uses one retry if any are left.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.max_retries {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.max_retries
    }
}

/// How long to wait before a retry of the given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Retry the same request after the backoff delay
    Retry,
    /// Reset the local database, reconnect, then retry
    ResetDatabase,
    /// Surface the error to the caller
    None,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(timeouts: &TimeoutConfig) -> Self {
        Self {
            backoff: timeouts.retry_backoff(),
        }
    }

    /// Delay before retrying after `recovery`. Database recovery already
    /// waits on the reconnect, so it retries immediately.
    pub fn delay_for(&self, recovery: Recovery) -> Duration {
        match recovery {
            Recovery::Retry => self.backoff,
            Recovery::ResetDatabase | Recovery::None => Duration::ZERO,
        }
    }
}
