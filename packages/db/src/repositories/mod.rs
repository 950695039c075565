//! Repository implementations for database operations.

mod config_repo;
mod job_repo;
mod worker_repo;

pub use config_repo::ConfigRepository;
pub use job_repo::{JobFilter, JobRepository, ReapReport};
pub use worker_repo::{WorkerInfo, WorkerRepository};
