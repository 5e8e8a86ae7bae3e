use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;

/// Coarse classification of a failed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// `401`; handled by the refresh path, never retried here
    Unauthorized,
    /// No response was received (connection refused, reset, timeout)
    Network,
    /// Any other 4xx
    Client,
    /// 5xx
    Server,
}

impl FailureClass {
    pub fn of_status(status: StatusCode) -> Self {
        if status == StatusCode::UNAUTHORIZED {
            Self::Unauthorized
        } else if status.is_server_error() {
            Self::Server
        } else {
            Self::Client
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const GIVE_UP: Self = Self {
        retry: false,
        delay: Duration::ZERO,
    };
}

/// Retry policy configuration
///
/// Only network-class failures are retried. The delay before retry `n`
/// (0-based) is `base_delay * backoff_multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// `attempt` is the number of retries already made for this request.
    pub fn should_retry(&self, failure: FailureClass, attempt: u32) -> RetryDecision {
        if failure != FailureClass::Network || attempt >= self.max_attempts {
            return RetryDecision::GIVE_UP;
        }

        RetryDecision {
            retry: true,
            delay: self.delay_for_attempt(attempt),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Per-request retry bookkeeping. Lives only as long as one logical send.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    pub first_attempt_at: Instant,
    pub has_retried_after_refresh: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            first_attempt_at: Instant::now(),
            has_retried_after_refresh: false,
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}
