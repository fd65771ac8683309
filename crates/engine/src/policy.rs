//! Retry and ramp-up pacing policies

use std::time::Duration;

use kite_common::TestConfig;

/// What to do after a session acquisition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32 },
    GiveUp,
}

/// Retries apply to session acquisition only; script failures are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    max_retry_count: u32,
}

impl RetryPolicy {
    pub fn new(max_retry_count: u32) -> Self {
        Self { max_retry_count }
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Attempts are zero-based; a tuple gets at most `max + 1` attempts.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retry_count {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Staggers runner start times in bursts of `increment`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampUp {
    increment: usize,
    interval: Duration,
}

impl RampUp {
    pub fn new(increment: usize, interval: Duration) -> Self {
        Self {
            increment: increment.max(1),
            interval,
        }
    }

    pub fn from_config(config: &TestConfig) -> Self {
        Self::new(config.increment, config.interval())
    }

    /// Offset from batch start at which runner `index` may begin
    pub fn delay_for(&self, index: usize) -> Duration {
        let burst = (index / self.increment) as u32;
        self.interval.saturating_mul(burst)
    }
}

impl Default for RampUp {
    fn default() -> Self {
        Self::new(1, Duration::ZERO)
    }
}
