//! Dead letter queue: a view over jobs that exhausted their retries.

use chrono::{DateTime, Utc};
use queue_core::{Job, JobId, JobState};
use serde::Serialize;

use crate::DbError;
use crate::repositories::{JobFilter, JobRepository};

/// A dead job as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadJob {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub output_log: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for DeadJob {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            command: job.command,
            args: job.args,
            attempts: job.attempts,
            max_retries: job.max_retries,
            last_error: job.last_error,
            output_log: job.output_log,
            updated_at: job.updated_at,
        }
    }
}

/// Read and requeue access restricted to `dead` jobs.
#[derive(Clone)]
pub struct DeadLetterQueue {
    jobs: JobRepository,
}

impl DeadLetterQueue {
    pub fn new(jobs: JobRepository) -> Self {
        Self { jobs }
    }

    pub async fn list(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<DeadJob>, DbError> {
        let filter = JobFilter {
            limit,
            offset,
            ..JobFilter::state(JobState::Dead)
        };
        let jobs = self.jobs.list(filter).await?;
        Ok(jobs.into_iter().map(DeadJob::from).collect())
    }

    /// Fetch one dead job; anything not dead is reported as not found.
    pub async fn get(&self, id: JobId) -> Result<DeadJob, DbError> {
        let job = self.jobs.get(id).await?;
        if job.state != JobState::Dead {
            return Err(DbError::NotFound(format!("Job {} is {}, not dead", id, job.state)));
        }
        Ok(job.into())
    }

    pub async fn count(&self) -> Result<u64, DbError> {
        Ok(self.jobs.count_by_state().await?.dead)
    }

    /// Return a dead job to pending with attempts reset to zero.
    pub async fn retry(&self, id: JobId) -> Result<Job, DbError> {
        self.jobs.requeue_from_dlq(id).await
    }
}
