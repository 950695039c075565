#![allow(dead_code)]

use std::error::Error;
use std::time::Duration;

use db::repositories::JobRepository;
use db::DbConfig;
use queue_core::{Job, JobId, QueueConfig};

/// Short timings so lease expiry and retries happen within a test run.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        lease_secs: 2,
        heartbeat_secs: 1,
        poll_interval_ms: 50,
        kill_grace_ms: 200,
        backoff_cap_secs: 0,
        ..QueueConfig::default()
    }
}

/// A job repository on a fresh in-memory database, using the wall clock.
pub async fn setup_jobs(config: QueueConfig) -> Result<JobRepository, Box<dyn Error>> {
    let db = db::connect(&DbConfig::memory()).await?;
    Ok(JobRepository::new(db, config))
}

/// Poll the store until `done` holds for the job, or fail after `within`.
pub async fn wait_for_job(
    jobs: &JobRepository,
    id: JobId,
    within: Duration,
    done: impl Fn(&Job) -> bool,
) -> Result<Job, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let job = jobs.get(id).await?;
        if done(&job) {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("job {} stuck in {:?} after {:?}", id, job.state, within).into());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
