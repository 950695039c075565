//! Queue-wide settings and aggregate counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::job::JobState;
use crate::retry::RetryPolicy;

/// Largest integer the store can hold; settings and limits must fit in it.
pub const MAX_STORED_INT: u64 = i64::MAX as u64;

/// Configuration shared by every worker of a queue.
///
/// Persisted as a single settings record; every field has a default so a
/// partially written record still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retries allowed after the first attempt for jobs that don't set their own.
    pub max_retries: u32,
    /// Base of the exponential backoff; the retry delay is `base^attempts` seconds.
    pub backoff_base: f64,
    /// Upper bound on a single retry delay.
    pub backoff_cap_secs: u64,
    /// Execution budget for jobs that don't set their own.
    pub default_timeout_secs: u64,
    /// Length of a lease from claim or heartbeat.
    pub lease_secs: u64,
    /// How often a busy worker renews its lease.
    pub heartbeat_secs: u64,
    /// How long an idle worker waits before polling again.
    pub poll_interval_ms: u64,
    /// Number of workers started by `worker start` when not overridden.
    pub concurrency: u32,
    /// Grace period between SIGTERM and SIGKILL on timeout.
    pub kill_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            backoff_cap_secs: 3600,
            default_timeout_secs: 300,
            lease_secs: 60,
            heartbeat_secs: 15,
            poll_interval_ms: 1000,
            concurrency: 1,
            kill_grace_ms: 2000,
        }
    }
}

impl QueueConfig {
    /// Keys accepted by [`QueueConfig::get`] and [`QueueConfig::set`].
    pub const KEYS: [&'static str; 9] = [
        "max-retries",
        "backoff-base",
        "backoff-cap",
        "default-timeout",
        "lease-duration",
        "heartbeat-interval",
        "poll-interval",
        "workers",
        "kill-grace",
    ];

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (key, value) in [
            ("backoff-cap", self.backoff_cap_secs),
            ("default-timeout", self.default_timeout_secs),
            ("lease-duration", self.lease_secs),
            ("heartbeat-interval", self.heartbeat_secs),
            ("poll-interval", self.poll_interval_ms),
            ("kill-grace", self.kill_grace_ms),
        ] {
            if value > MAX_STORED_INT {
                return Err(ValidationError::invalid(
                    key,
                    format!("must be at most {MAX_STORED_INT}"),
                ));
            }
        }
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(ValidationError::invalid("backoff-base", "must be a number >= 1"));
        }
        if self.default_timeout_secs == 0 {
            return Err(ValidationError::invalid("default-timeout", "must be at least 1"));
        }
        if self.heartbeat_secs == 0 {
            return Err(ValidationError::invalid("heartbeat-interval", "must be at least 1"));
        }
        if self.lease_secs < self.heartbeat_secs.saturating_mul(2) {
            return Err(ValidationError::invalid(
                "lease-duration",
                format!("must be at least twice the heartbeat interval ({}s)", self.heartbeat_secs),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::invalid("poll-interval", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(ValidationError::invalid("workers", "must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(self)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Read a setting by its command-line key.
    pub fn get(&self, key: &str) -> Result<String, ValidationError> {
        let value = match key {
            "max-retries" => self.max_retries.to_string(),
            "backoff-base" => self.backoff_base.to_string(),
            "backoff-cap" => self.backoff_cap_secs.to_string(),
            "default-timeout" => self.default_timeout_secs.to_string(),
            "lease-duration" => self.lease_secs.to_string(),
            "heartbeat-interval" => self.heartbeat_secs.to_string(),
            "poll-interval" => self.poll_interval_ms.to_string(),
            "workers" => self.concurrency.to_string(),
            "kill-grace" => self.kill_grace_ms.to_string(),
            other => return Err(ValidationError::UnknownConfigKey(other.to_string())),
        };
        Ok(value)
    }

    /// Update a setting by its command-line key.
    ///
    /// The change is applied only if the resulting configuration validates.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ValidationError> {
        let mut next = self.clone();
        match key {
            "max-retries" => next.max_retries = parse(key, value)?,
            "backoff-base" => next.backoff_base = parse(key, value)?,
            "backoff-cap" => next.backoff_cap_secs = parse(key, value)?,
            "default-timeout" => next.default_timeout_secs = parse(key, value)?,
            "lease-duration" => next.lease_secs = parse(key, value)?,
            "heartbeat-interval" => next.heartbeat_secs = parse(key, value)?,
            "poll-interval" => next.poll_interval_ms = parse(key, value)?,
            "workers" => next.concurrency = parse(key, value)?,
            "kill-grace" => next.kill_grace_ms = parse(key, value)?,
            other => return Err(ValidationError::UnknownConfigKey(other.to_string())),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ValidationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ValidationError::invalid(key, e.to_string()))
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += count;
    }

    /// Total jobs across all states.
    pub fn total(&self) -> u64 {
        JobState::ALL.into_iter().map(|state| self.get(state)).sum()
    }

    /// Jobs that still have work ahead of them.
    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }
}
