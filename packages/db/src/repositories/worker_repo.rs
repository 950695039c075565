//! Worker liveness rows shared between processes.

use chrono::{DateTime, Utc};
use queue_core::JobId;
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::time::{from_micros, to_micros};
use crate::{Database, DbError};

/// A worker as last reported by its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub pool_id: String,
    pub pid: u32,
    pub current_job: Option<JobId>,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    worker_id: String,
    pool_id: String,
    pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_job: Option<String>,
    started_at: i64,
    last_seen: i64,
}

impl TryFrom<WorkerRecord> for WorkerInfo {
    type Error = DbError;

    fn try_from(record: WorkerRecord) -> Result<Self, Self::Error> {
        let current_job = record
            .current_job
            .as_deref()
            .map(JobId::parse)
            .transpose()
            .map_err(|e| DbError::Serialization(format!("bad job id on worker row: {e}")))?;
        Ok(WorkerInfo {
            worker_id: record.worker_id,
            pool_id: record.pool_id,
            pid: record.pid,
            current_job,
            started_at: from_micros(record.started_at)?,
            last_seen: from_micros(record.last_seen)?,
        })
    }
}

/// Repository for the `worker` table.
#[derive(Clone)]
pub struct WorkerRepository {
    db: Database,
}

impl WorkerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a worker row.
    pub async fn upsert(&self, worker: &WorkerInfo) -> Result<(), DbError> {
        let record = WorkerRecord {
            id: None,
            worker_id: worker.worker_id.clone(),
            pool_id: worker.pool_id.clone(),
            pid: worker.pid,
            current_job: worker.current_job.map(|id| id.to_string()),
            started_at: to_micros(worker.started_at),
            last_seen: to_micros(worker.last_seen),
        };
        let _: Option<WorkerRecord> = self
            .db
            .upsert(("worker", worker.worker_id.clone()))
            .content(record)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, worker_id: &str) -> Result<(), DbError> {
        let _: Option<WorkerRecord> = self.db.delete(("worker", worker_id.to_string())).await?;
        Ok(())
    }

    /// Drop every row published by one pool.
    pub async fn remove_pool(&self, pool_id: &str) -> Result<(), DbError> {
        self.db
            .query("DELETE worker WHERE pool_id = $pool")
            .bind(("pool", pool_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Workers seen at or after `since`, across all pools.
    pub async fn list_live(&self, since: DateTime<Utc>) -> Result<Vec<WorkerInfo>, DbError> {
        let mut response = self
            .db
            .query("SELECT * FROM worker WHERE last_seen >= $since ORDER BY worker_id ASC")
            .bind(("since", to_micros(since)))
            .await?;
        let records: Vec<WorkerRecord> = response.take(0)?;

        records.into_iter().map(WorkerInfo::try_from).collect()
    }
}
