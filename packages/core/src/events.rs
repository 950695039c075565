//! Lifecycle events published by the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Events emitted while workers process jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Worker events
    /// A worker joined the pool.
    WorkerStarted {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker left the pool after finishing its current job.
    WorkerStopped {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker died unexpectedly and may be replaced.
    WorkerCrashed {
        worker_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Job events
    /// A worker won the claim on a job.
    JobClaimed {
        job_id: JobId,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job finished with exit status 0.
    JobCompleted {
        job_id: JobId,
        worker_id: String,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A failed job was rescheduled.
    JobRetrying {
        job_id: JobId,
        worker_id: String,
        attempts: u32,
        error: String,
        retry_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A job exhausted its retries.
    JobDead {
        job_id: JobId,
        worker_id: Option<String>,
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker found its lease taken over before it could report.
    LeaseLost {
        job_id: JobId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Expired leases were swept.
    LeasesReaped {
        requeued: u64,
        dead: u64,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::WorkerStarted { timestamp, .. }
            | JobEvent::WorkerStopped { timestamp, .. }
            | JobEvent::WorkerCrashed { timestamp, .. }
            | JobEvent::JobClaimed { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobRetrying { timestamp, .. }
            | JobEvent::JobDead { timestamp, .. }
            | JobEvent::LeaseLost { timestamp, .. }
            | JobEvent::LeasesReaped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobClaimed { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobRetrying { job_id, .. }
            | JobEvent::JobDead { job_id, .. }
            | JobEvent::LeaseLost { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get the worker ID associated with this event, if any.
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            JobEvent::WorkerStarted { worker_id, .. }
            | JobEvent::WorkerStopped { worker_id, .. }
            | JobEvent::WorkerCrashed { worker_id, .. }
            | JobEvent::JobClaimed { worker_id, .. }
            | JobEvent::JobCompleted { worker_id, .. }
            | JobEvent::JobRetrying { worker_id, .. }
            | JobEvent::LeaseLost { worker_id, .. } => Some(worker_id),
            JobEvent::JobDead { worker_id, .. } => worker_id.as_deref(),
            JobEvent::LeasesReaped { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::WorkerStarted { worker_id, .. } => format!("Worker {} started", worker_id),
            JobEvent::WorkerStopped { worker_id, .. } => format!("Worker {} stopped", worker_id),
            JobEvent::WorkerCrashed {
                worker_id, error, ..
            } => format!("Worker {} crashed: {}", worker_id, error),
            JobEvent::JobClaimed {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} claimed by {} (attempt {})", job_id, worker_id, attempt),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobRetrying {
                job_id,
                error,
                retry_at,
                ..
            } => format!("Job {} failed: {} (retry at {})", job_id, error, retry_at),
            JobEvent::JobDead {
                job_id,
                attempts,
                error,
                ..
            } => format!("Job {} dead after {} attempts: {}", job_id, attempts, error),
            JobEvent::LeaseLost {
                job_id, worker_id, ..
            } => format!("Worker {} lost the lease on job {}", worker_id, job_id),
            JobEvent::LeasesReaped { requeued, dead, .. } => {
                format!("Reaped leases: {} requeued, {} dead", requeued, dead)
            }
        }
    }
}
