//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobState and NewJob for work items
//! - QueueConfig and QueueStats for queue-wide settings and counts
//! - RetryPolicy for backoff and dead-letter decisions
//! - Clock for injectable time
//! - Events for lifecycle notifications

mod clock;
mod error;
mod events;
mod job;
mod queue;
mod retry;

pub use clock::{Clock, ManualClock, SystemClock, after};
pub use error::ValidationError;
pub use events::JobEvent;
pub use job::{Job, JobId, JobState, Lease, NewJob};
pub use queue::{MAX_STORED_INT, QueueConfig, QueueStats};
pub use retry::{RetryDecision, RetryPolicy};
