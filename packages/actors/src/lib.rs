//! Actor system for running queued jobs.
//!
//! This crate provides the Ractor-based worker pool that claims jobs from
//! the store, runs them under a deadline and reports every attempt back.
//!
//! # Architecture
//!
//! - `PoolActor` - Supervises workers, restarts crashed ones and sweeps expired leases
//! - `WorkerActor` - Claims one job at a time, heartbeats its lease and records the result
//! - `JobRunner` - What "running a job" means; `ShellRunner` executes the command
//!
//! Workers share nothing but the store: a crashed worker's job is reclaimed by
//! whoever claims it after its lease expires.
//!
//! # Usage
//!
//! ```ignore
//! use actors::{ShellRunner, WorkerPool};
//!
//! let runner = Arc::new(ShellRunner::new(jobs.config().kill_grace()));
//! let pool = WorkerPool::start(jobs, runner, 4).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! pool.shutdown().await?;
//! ```

pub mod executor;
mod messages;
mod pool;
mod runner;
mod worker_actor;

pub use executor::{CommandExecutor, ExecutionOutcome, FailureKind};
pub use messages::{
    JobOutcome, PoolError, PoolMessage, PoolStatus, WorkerMessage, WorkerReport, WorkerStatus,
};
pub use pool::{PoolActor, WorkerPool};
pub use runner::{FnRunner, JobRunner, RunFuture, ShellRunner};
pub use worker_actor::{WorkerActor, WorkerSettings};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
