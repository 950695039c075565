//! Job domain types for work items in the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::after;
use crate::error::ValidationError;
use crate::queue::MAX_STORED_INT;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Lifecycle state of a job.
///
/// `pending -> processing -> completed | pending (retry) | dead`, with `dead`
/// reopened only by an explicit dead-letter requeue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed once `scheduled_at` has passed.
    #[default]
    Pending,
    /// Claimed by a worker holding a lease.
    Processing,
    /// Finished successfully.
    Completed,
    /// Recognised for filtering; the engine itself never assigns it.
    Failed,
    /// Retries exhausted; parked in the dead letter queue.
    Dead,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Get a simple state string for display and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownState(s.to_string()))
    }
}

/// A time-bounded claim on a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker instance holding the job.
    pub owner: String,
    /// The lease is live strictly before this instant.
    pub expires_at: DateTime<Utc>,
}

/// A job represents a unit of work to be executed by the queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Shell command to run.
    pub command: String,
    /// Positional arguments passed to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Current lifecycle state.
    pub state: JobState,
    /// Not eligible for claiming before this instant.
    pub scheduled_at: DateTime<Utc>,
    /// Number of execution attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// Failures beyond this many retries send the job to the dead letter queue.
    pub max_retries: u32,
    /// Execution budget in seconds.
    pub timeout_secs: u64,
    /// Present exactly while the job is processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Error reported by the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Captured output of the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Execution budget as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Owner of the live or stale lease, if any.
    pub fn lease_owner(&self) -> Option<&str> {
        self.lease.as_ref().map(|lease| lease.owner.as_str())
    }
}

/// Submission payload for a new job.
///
/// Unset limits are filled from the queue configuration at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
    #[serde(default, alias = "run_at")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a submission for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Set the positional arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the max retries for this job.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the timeout for this job.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Hold the job back until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Hold the job back for `delay` measured from `now`.
    pub fn delayed(mut self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.scheduled_at = Some(after(now, delay));
        self
    }

    /// Reject payloads that can never run.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::MissingCommand);
        }
        if self.command.contains('\0') || self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(ValidationError::NulByte);
        }
        match self.timeout_secs {
            Some(0) => return Err(ValidationError::ZeroTimeout),
            Some(secs) if secs > MAX_STORED_INT => {
                return Err(ValidationError::TimeoutTooLarge { max: MAX_STORED_INT });
            }
            _ => {}
        }
        Ok(())
    }
}
