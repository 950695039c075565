//! Retry policy: exponential backoff and the dead-letter decision.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::after;
use crate::queue::QueueConfig;

/// Exponential backoff without jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after attempt `n` is `backoff_base^n` seconds. Never below 1.
    pub backoff_base: f64,
    /// No single delay exceeds this.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: 2.0,
            backoff_cap: Duration::from_secs(3600),
        }
    }
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending, eligible again at `run_at`.
    Retry { delay: Duration, run_at: DateTime<Utc> },
    /// Out of retries.
    Dead,
}

impl RetryPolicy {
    pub fn new(backoff_base: f64, backoff_cap: Duration) -> Self {
        Self {
            backoff_base: backoff_base.max(1.0),
            backoff_cap,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.backoff_base, Duration::from_secs(config.backoff_cap_secs))
    }

    /// Delay before the next attempt, given how many attempts have been made.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let cap = self.backoff_cap.as_secs_f64();
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let raw = self.backoff_base.powi(exponent);
        let secs = if raw.is_finite() { raw.min(cap) } else { cap };
        // A cap near u64::MAX rounds up past what a Duration can hold.
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(self.backoff_cap)
    }

    /// Decide the fate of a job after failed attempt number `attempts`.
    pub fn decide(&self, attempts: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts > max_retries {
            return RetryDecision::Dead;
        }
        let delay = self.delay_for_attempt(attempts);
        RetryDecision::Retry {
            delay,
            run_at: after(now, delay),
        }
    }
}
