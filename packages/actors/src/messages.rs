//! Message types for actor communication.

use chrono::{DateTime, Utc};
use queue_core::JobId;
use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Try to claim and run one job.
    Poll,
}

/// What a worker tells its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// Polled and found nothing to do.
    Idle,
    /// Won the claim on a job.
    Claimed { job_id: JobId, attempt: u32 },
    /// Renewed the lease on its current job.
    Heartbeat { job_id: JobId },
    /// Reported the attempt back to the store.
    Finished { job_id: JobId, outcome: JobOutcome },
}

/// How a claimed job left the worker's hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    Dead,
    /// Another worker holds the lease now; the result was discarded.
    LeaseLost,
    /// The store rejected the report for another reason.
    StoreError,
}

/// Messages for the PoolActor.
#[derive(Debug)]
pub enum PoolMessage {
    /// Progress from one of the pool's workers.
    Report {
        worker_id: String,
        report: WorkerReport,
    },

    /// Get a snapshot of the pool.
    GetStatus { reply: RpcReplyPort<PoolStatus> },

    /// Stop claiming, let running jobs finish, then stop. The reply carries
    /// the counters as they stand once the last worker is gone.
    Drain {
        reply: Option<RpcReplyPort<PoolStatus>>,
    },

    /// Periodic tick for housekeeping.
    Tick,
}

/// Liveness of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub current_job: Option<JobId>,
    pub last_seen: DateTime<Utc>,
    pub alive: bool,
}

/// Snapshot of a pool: its workers and what they have done since it started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub pool_id: String,
    pub workers: Vec<WorkerStatus>,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead: u64,
    pub conflicts: u64,
    pub restarts: u64,
    pub draining: bool,
}

impl PoolStatus {
    /// Workers that reported within the liveness window.
    pub fn alive_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Workers currently holding a job.
    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.current_job.is_some()).count()
    }
}

/// Error type for pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn pool: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Pool is not running: {0}")]
    NotRunning(String),

    #[error("Pool did not answer in time")]
    Timeout,

    #[error("Pool task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] queue_core::ValidationError),
}
