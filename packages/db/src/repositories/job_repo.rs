//! Job repository: the durable job store and its claim protocol.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{
    Clock, Job, JobId, JobState, Lease, NewJob, QueueConfig, QueueStats, RetryDecision,
    RetryPolicy, SystemClock, after,
};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::time::{from_micros, to_micros};
use crate::{Database, DbError};

/// How many times a claim re-selects after losing a race before giving up.
const CLAIM_ATTEMPTS: u32 = 16;

/// Error recorded on jobs whose final attempt died with its worker.
const LEASE_EXPIRED_ERROR: &str = "lease expired before the worker reported back";

/// Claimable: scheduled, and either pending or an orphan with attempts left.
const ELIGIBLE: &str = "scheduled_at <= $now AND (state = 'pending' OR \
     (state = 'processing' AND lease_expires_at < $now AND attempts <= max_retries))";

/// Repository for job persistence operations.
///
/// Clones share the database handle, clock and claim gate.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
    config: QueueConfig,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    claim_gate: Arc<Mutex<()>>,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    job_id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    priority: i32,
    state: JobState,
    scheduled_at: i64,
    attempts: u32,
    max_retries: u32,
    timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_log: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        let id = JobId::parse(&record.job_id)
            .map_err(|e| DbError::Serialization(format!("bad job id {}: {e}", record.job_id)))?;
        let lease = match (record.lease_owner, record.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease {
                owner,
                expires_at: from_micros(expires_at)?,
            }),
            _ => None,
        };
        Ok(Job {
            id,
            command: record.command,
            args: record.args,
            priority: record.priority,
            state: record.state,
            scheduled_at: from_micros(record.scheduled_at)?,
            attempts: record.attempts,
            max_retries: record.max_retries,
            timeout_secs: record.timeout_secs,
            lease,
            last_error: record.last_error,
            output_log: record.output_log,
            created_at: from_micros(record.created_at)?,
            updated_at: from_micros(record.updated_at)?,
        })
    }
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

/// Outcome of a lease sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Orphans returned to pending with attempts unchanged.
    pub requeued: Vec<JobId>,
    /// Orphans whose lost attempt was their last.
    pub dead: Vec<JobId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.dead.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    job_id: String,
}

impl JobRepository {
    /// Create a repository using the wall clock.
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self {
            db,
            policy: config.retry_policy(),
            config,
            clock: Arc::new(SystemClock),
            claim_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Insert a new pending job, filling unset limits from the configuration.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job, DbError> {
        new_job.validate()?;

        let now = to_micros(self.clock.now());
        let id = JobId::new();
        let record = JobRecord {
            id: None,
            job_id: id.to_string(),
            command: new_job.command,
            args: new_job.args,
            priority: new_job.priority,
            state: JobState::Pending,
            scheduled_at: new_job.scheduled_at.map(to_micros).unwrap_or(now),
            attempts: 0,
            max_retries: new_job.max_retries.unwrap_or(self.config.max_retries),
            timeout_secs: new_job
                .timeout_secs
                .unwrap_or(self.config.default_timeout_secs),
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            output_log: None,
            created_at: now,
            updated_at: now,
        };

        let created: Option<JobRecord> = self
            .db
            .create(("job", id.to_string()))
            .content(record)
            .await?;

        let job: Job = created
            .ok_or_else(|| DbError::Query("Failed to create job".into()))?
            .try_into()?;
        info!(job_id = %job.id, priority = job.priority, "Job enqueued");
        Ok(job)
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;

        record
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))?
            .try_into()
    }

    /// Atomically claim the best eligible job for `worker_id`.
    ///
    /// Picks the highest priority, then oldest, job that is pending or whose
    /// lease has expired, and leases it until `now + lease`. The conditional
    /// update re-checks eligibility on that record, so two claimers, even in
    /// different processes, can never both win it.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, DbError> {
        let _gate = self.claim_gate.lock().await;

        for attempt in 1..=CLAIM_ATTEMPTS {
            let now = self.clock.now();
            let now_us = to_micros(now);

            let mut response = self
                .db
                .query(format!(
                    "SELECT job_id, priority, created_at FROM job WHERE {ELIGIBLE} \
                     ORDER BY priority DESC, created_at ASC, job_id ASC LIMIT 1"
                ))
                .bind(("now", now_us))
                .await?;
            let candidates: Vec<Candidate> = response.take(0)?;
            let Some(candidate) = candidates.into_iter().next() else {
                return Ok(None);
            };

            let expires_us = to_micros(after(now, lease));
            match self
                .try_claim(candidate.job_id.clone(), worker_id, now_us, expires_us)
                .await
            {
                Ok(Some(record)) => {
                    let job: Job = record.try_into()?;
                    debug!(job_id = %job.id, worker_id, attempt = job.attempts, "Job claimed");
                    return Ok(Some(job));
                }
                Ok(None) => {
                    debug!(job_id = %candidate.job_id, worker_id, attempt, "Lost claim race");
                }
                Err(e) if is_retryable(&e) => {
                    debug!(
                        job_id = %candidate.job_id,
                        worker_id,
                        attempt,
                        error = %e,
                        "Claim conflicted"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(worker_id, "Claim gave up under contention");
        Err(DbError::Contention {
            attempts: CLAIM_ATTEMPTS,
        })
    }

    async fn try_claim(
        &self,
        job_id: String,
        worker_id: &str,
        now_us: i64,
        expires_us: i64,
    ) -> Result<Option<JobRecord>, surrealdb::Error> {
        let mut response = self
            .db
            .query(format!(
                "UPDATE type::thing('job', $id) SET state = 'processing', lease_owner = $worker, \
                 lease_expires_at = $expires, attempts += 1, updated_at = $now \
                 WHERE {ELIGIBLE} RETURN AFTER"
            ))
            .bind(("id", job_id))
            .bind(("worker", worker_id.to_string()))
            .bind(("expires", expires_us))
            .bind(("now", now_us))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;
        Ok(records.into_iter().next())
    }

    /// Record a successful attempt.
    ///
    /// Fails with [`DbError::Conflict`] if `worker_id` no longer holds the lease.
    pub async fn mark_completed(
        &self,
        id: JobId,
        worker_id: &str,
        output: Option<String>,
    ) -> Result<Job, DbError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id) SET state = 'completed', lease_owner = NONE, \
                 lease_expires_at = NONE, last_error = NONE, output_log = $output, \
                 updated_at = $now \
                 WHERE state = 'processing' AND lease_owner = $worker RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("worker", worker_id.to_string()))
            .bind(("output", output))
            .bind(("now", to_micros(self.clock.now())))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        match records.into_iter().next() {
            Some(record) => {
                let job: Job = record.try_into()?;
                info!(job_id = %id, worker_id, attempts = job.attempts, "Job completed");
                Ok(job)
            }
            None => Err(self.lease_miss(id, worker_id).await),
        }
    }

    /// Record a failed attempt and apply the retry policy.
    ///
    /// The job goes back to pending with a backoff delay, or to `dead` once
    /// `attempts > max_retries`. Fails with [`DbError::Conflict`] if
    /// `worker_id` no longer holds the lease.
    pub async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        output: Option<String>,
    ) -> Result<Job, DbError> {
        let current = self.get(id).await?;
        if current.state != JobState::Processing || current.lease_owner() != Some(worker_id) {
            return Err(DbError::Conflict {
                job_id: id,
                owner: current.lease_owner().map(str::to_string),
            });
        }

        let now = self.clock.now();
        let decision = self.policy.decide(current.attempts, current.max_retries, now);
        let (state, scheduled_at) = match decision {
            RetryDecision::Retry { run_at, .. } => (JobState::Pending, to_micros(run_at)),
            RetryDecision::Dead => (JobState::Dead, to_micros(current.scheduled_at)),
        };

        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id) SET state = $state, scheduled_at = $scheduled_at, \
                 lease_owner = NONE, lease_expires_at = NONE, last_error = $error, \
                 output_log = $output, updated_at = $now \
                 WHERE state = 'processing' AND lease_owner = $worker AND attempts = $attempts \
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("state", state))
            .bind(("scheduled_at", scheduled_at))
            .bind(("error", error.to_string()))
            .bind(("output", output))
            .bind(("now", to_micros(now)))
            .bind(("worker", worker_id.to_string()))
            .bind(("attempts", current.attempts))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        let Some(record) = records.into_iter().next() else {
            return Err(self.lease_miss(id, worker_id).await);
        };
        let job: Job = record.try_into()?;
        match job.state {
            JobState::Dead => {
                warn!(
                    job_id = %id,
                    worker_id,
                    attempts = job.attempts,
                    error,
                    "Job moved to dead letter queue"
                )
            }
            _ => {
                info!(
                    job_id = %id,
                    worker_id,
                    attempts = job.attempts,
                    retry_at = %job.scheduled_at,
                    error,
                    "Job scheduled for retry"
                )
            }
        }
        Ok(job)
    }

    /// Extend the lease of a running job to `now + extend_by`.
    pub async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        extend_by: Duration,
    ) -> Result<Job, DbError> {
        let now = self.clock.now();
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id) SET lease_expires_at = $expires, updated_at = $now \
                 WHERE state = 'processing' AND lease_owner = $worker RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("worker", worker_id.to_string()))
            .bind(("expires", to_micros(after(now, extend_by))))
            .bind(("now", to_micros(now)))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        match records.into_iter().next() {
            Some(record) => record.try_into(),
            None => Err(self.lease_miss(id, worker_id).await),
        }
    }

    /// Explain why a lease-guarded update matched nothing.
    async fn lease_miss(&self, id: JobId, worker_id: &str) -> DbError {
        match self.get(id).await {
            Ok(job) => {
                let owner = job.lease_owner().map(str::to_string);
                warn!(
                    job_id = %id,
                    worker_id,
                    owner = ?owner,
                    state = %job.state,
                    "Lease no longer held"
                );
                DbError::Conflict { job_id: id, owner }
            }
            Err(e) => e,
        }
    }

    /// List jobs with optional filtering, oldest first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DbError> {
        let mut conditions = Vec::new();

        if filter.state.is_some() {
            conditions.push("state = $state");
        }
        if filter.min_priority.is_some() {
            conditions.push("priority >= $min_priority");
        }
        if filter.max_priority.is_some() {
            conditions.push("priority <= $max_priority");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let offset_clause = filter
            .offset
            .map(|o| format!("START {}", o))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM job {} ORDER BY created_at ASC, job_id ASC {} {}",
            where_clause, limit_clause, offset_clause
        );

        let mut response = self
            .db
            .query(query)
            .bind(("state", filter.state))
            .bind(("min_priority", filter.min_priority))
            .bind(("max_priority", filter.max_priority))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        records.into_iter().map(Job::try_from).collect()
    }

    /// Count jobs in each state.
    pub async fn count_by_state(&self) -> Result<QueueStats, DbError> {
        #[derive(Deserialize)]
        struct StateCount {
            state: JobState,
            count: u64,
        }

        let mut response = self
            .db
            .query("SELECT state, count() AS count FROM job GROUP BY state")
            .await?;
        let counts: Vec<StateCount> = response.take(0)?;

        let mut stats = QueueStats::default();
        for row in counts {
            stats.add(row.state, row.count);
        }
        Ok(stats)
    }

    /// Sweep expired leases.
    ///
    /// Orphans with attempts left go back to pending untouched; orphans whose
    /// lost attempt was their last go to `dead`.
    pub async fn reap_expired_leases(&self) -> Result<ReapReport, DbError> {
        let now = to_micros(self.clock.now());

        let mut response = self
            .db
            .query(
                "UPDATE job SET state = 'pending', lease_owner = NONE, lease_expires_at = NONE, \
                 updated_at = $now \
                 WHERE state = 'processing' AND lease_expires_at < $now \
                 AND attempts <= max_retries \
                 RETURN job_id;",
            )
            .query(
                "UPDATE job SET state = 'dead', lease_owner = NONE, lease_expires_at = NONE, \
                 last_error = $error, updated_at = $now \
                 WHERE state = 'processing' AND lease_expires_at < $now AND attempts > max_retries \
                 RETURN job_id;",
            )
            .bind(("now", now))
            .bind(("error", LEASE_EXPIRED_ERROR))
            .await?;
        let requeued: Vec<Candidate> = response.take(0)?;
        let dead: Vec<Candidate> = response.take(1)?;

        let report = ReapReport {
            requeued: parse_ids(requeued)?,
            dead: parse_ids(dead)?,
        };
        if !report.is_empty() {
            warn!(
                requeued = report.requeued.len(),
                dead = report.dead.len(),
                "Reclaimed jobs with expired leases"
            );
        }
        Ok(report)
    }

    /// Reset a dead job to pending with a fresh retry budget.
    pub async fn requeue_from_dlq(&self, id: JobId) -> Result<Job, DbError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id) SET state = 'pending', attempts = 0, \
                 last_error = NONE, scheduled_at = $now, updated_at = $now \
                 WHERE state = 'dead' RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("now", to_micros(self.clock.now())))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        let job: Job = records
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("No dead job with id {}", id)))?
            .try_into()?;
        info!(job_id = %id, "Job requeued from dead letter queue");
        Ok(job)
    }
}

fn parse_ids(rows: Vec<Candidate>) -> Result<Vec<JobId>, DbError> {
    rows.into_iter()
        .map(|row| {
            JobId::parse(&row.job_id)
                .map_err(|e| DbError::Serialization(format!("bad job id {}: {e}", row.job_id)))
        })
        .collect()
}

/// Transaction conflicts reported by the storage engine are safe to retry.
fn is_retryable(error: &surrealdb::Error) -> bool {
    use surrealdb::error::{Api, Db};

    match error {
        surrealdb::Error::Db(Db::TxRetryable) => true,
        // Remote engines hand back only the server's message.
        surrealdb::Error::Api(Api::Query(message)) => message.contains("can be retried"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surrealdb::error::{Api, Db};

    #[test]
    fn only_transaction_conflicts_are_retried() {
        assert!(is_retryable(&surrealdb::Error::Db(Db::TxRetryable)));
        assert!(is_retryable(&surrealdb::Error::Api(Api::Query(
            "Failed to commit transaction due to a read or write conflict. \
             This transaction can be retried"
                .into()
        ))));
        assert!(!is_retryable(&surrealdb::Error::Db(Db::Thrown("boom".into()))));
        assert!(!is_retryable(&surrealdb::Error::Api(Api::Query(
            "There was a problem with the database".into()
        ))));
    }
}
