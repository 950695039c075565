#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use db::repositories::JobRepository;
use db::{Database, DbConfig, DbError};
use queue_core::{ManualClock, QueueConfig};

pub const LEASE: Duration = Duration::from_secs(30);

/// A fresh, empty in-memory database.
pub async fn setup_db() -> Result<Database, DbError> {
    db::connect(&DbConfig::memory()).await
}

/// A whole-second starting point keeps microsecond storage exact.
pub fn fixed_clock() -> ManualClock {
    ManualClock::new(DateTime::<Utc>::from_timestamp(1_900_000_000, 0).unwrap_or_default())
}

/// A job repository on a fresh database, driven by a manual clock.
pub async fn setup_repo(config: QueueConfig) -> Result<(JobRepository, ManualClock), DbError> {
    let db = setup_db().await?;
    let clock = fixed_clock();
    let repo = JobRepository::new(db, config).with_clock(clock.clone());
    Ok((repo, clock))
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
