#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use chrono::Utc;
use common::{LEASE, secs, setup_db, setup_repo};
use db::DbError;
use db::repositories::{ConfigRepository, JobFilter, WorkerInfo, WorkerRepository};
use queue_core::{JobId, JobState, MAX_STORED_INT, NewJob, QueueConfig, ValidationError};

#[tokio::test]
async fn list_filters_by_state_and_priority() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;

    let mut ids = Vec::new();
    for priority in [0, 3, 7, 10] {
        ids.push(repo.enqueue(NewJob::new("echo").with_priority(priority)).await?.id);
        clock.advance(secs(1));
    }
    // Highest priority goes to processing.
    repo.claim_next("w1", LEASE).await?.ok_or("no job")?;

    let all = repo.list(JobFilter::default()).await?;
    assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), ids, "oldest first");

    let pending = repo.list(JobFilter::state(JobState::Pending)).await?;
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|j| j.state == JobState::Pending));

    let mid = repo
        .list(JobFilter {
            min_priority: Some(3),
            max_priority: Some(7),
            ..Default::default()
        })
        .await?;
    assert_eq!(mid.iter().map(|j| j.priority).collect::<Vec<_>>(), vec![3, 7]);

    let failed = repo.list(JobFilter::state(JobState::Failed)).await?;
    assert!(failed.is_empty());

    Ok(())
}

#[tokio::test]
async fn list_pages_with_limit_and_offset() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(repo.enqueue(NewJob::new(format!("echo {n}"))).await?.id);
        clock.advance(secs(1));
    }

    let mut paged = Vec::new();
    let mut offset = 0;
    loop {
        let page = repo
            .list(JobFilter {
                limit: Some(2),
                offset: Some(offset),
                ..Default::default()
            })
            .await?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        paged.extend(page.into_iter().map(|j| j.id));
    }
    assert_eq!(paged, ids);

    Ok(())
}

#[tokio::test]
async fn counts_jobs_per_state() -> Result<(), Box<dyn Error>> {
    let (repo, _clock) = setup_repo(QueueConfig::default()).await?;

    let empty = repo.count_by_state().await?;
    assert_eq!(empty.total(), 0);

    for _ in 0..3 {
        repo.enqueue(NewJob::new("echo")).await?;
    }
    let doomed = repo.enqueue(NewJob::new("exit 1").with_max_retries(0).with_priority(9)).await?;
    let winner = repo.enqueue(NewJob::new("exit 0").with_priority(8)).await?;

    repo.claim_next("w1", LEASE).await?.ok_or("no job")?;
    repo.mark_failed(doomed.id, "w1", "exit 1", None).await?;
    repo.claim_next("w1", LEASE).await?.ok_or("no job")?;
    repo.mark_completed(winner.id, "w1", None).await?;
    repo.claim_next("w1", LEASE).await?.ok_or("no job")?;

    let stats = repo.count_by_state().await?;
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.total(), 5);

    Ok(())
}

#[tokio::test]
async fn config_defaults_then_persists_changes() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let configs = ConfigRepository::new(db.clone());

    assert_eq!(configs.load().await?, QueueConfig::default());
    assert_eq!(configs.get("max-retries").await?, "3");

    let updated = configs.set("max-retries", "5").await?;
    assert_eq!(updated.max_retries, 5);
    configs.set("backoff-base", "3").await?;

    // A second handle on the same store sees the change.
    let reloaded = ConfigRepository::new(db).load().await?;
    assert_eq!(reloaded.max_retries, 5);
    assert_eq!(reloaded.backoff_base, 3.0);

    let bad = configs.set("backoff-base", "0").await;
    assert!(matches!(
        bad,
        Err(DbError::Validation(ValidationError::InvalidValue { .. }))
    ));
    let unknown = configs.get("nope").await;
    assert!(matches!(
        unknown,
        Err(DbError::Validation(ValidationError::UnknownConfigKey(_)))
    ));
    assert_eq!(configs.load().await?.backoff_base, 3.0);

    Ok(())
}

#[tokio::test]
async fn oversized_settings_are_rejected_before_writing() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let configs = ConfigRepository::new(db);
    let too_big = (MAX_STORED_INT + 1).to_string();

    let rejected = configs.set("lease-duration", &too_big).await;
    assert!(matches!(
        rejected,
        Err(DbError::Validation(ValidationError::InvalidValue { .. }))
    ));

    // The store is still readable and writable afterwards.
    assert_eq!(configs.load().await?, QueueConfig::default());
    assert_eq!(configs.set("lease-duration", "90").await?.lease_secs, 90);

    Ok(())
}

#[tokio::test]
async fn oversized_timeout_is_never_inserted() -> Result<(), Box<dyn Error>> {
    let (repo, _clock) = setup_repo(QueueConfig::default()).await?;
    repo.enqueue(NewJob::new("echo ok")).await?;

    let rejected = repo
        .enqueue(NewJob::new("echo big").with_timeout(MAX_STORED_INT + 1))
        .await;
    assert!(matches!(
        rejected,
        Err(DbError::Validation(ValidationError::TimeoutTooLarge { .. }))
    ));

    assert_eq!(repo.count_by_state().await?.pending, 1);
    assert_eq!(repo.list(JobFilter::default()).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn worker_rows_track_liveness() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let workers = WorkerRepository::new(db);
    let now = Utc::now();

    let fresh = WorkerInfo {
        worker_id: "worker-a-0".to_string(),
        pool_id: "a".to_string(),
        pid: 42,
        current_job: Some(JobId::new()),
        started_at: now,
        last_seen: now,
    };
    let stale = WorkerInfo {
        worker_id: "worker-b-0".to_string(),
        pool_id: "b".to_string(),
        current_job: None,
        last_seen: now - chrono::Duration::minutes(10),
        ..fresh.clone()
    };
    workers.upsert(&fresh).await?;
    workers.upsert(&stale).await?;

    let live = workers.list_live(now - chrono::Duration::minutes(1)).await?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].worker_id, "worker-a-0");
    assert_eq!(live[0].current_job, fresh.current_job);

    // Upsert refreshes rather than duplicates.
    workers
        .upsert(&WorkerInfo {
            last_seen: now,
            ..stale.clone()
        })
        .await?;
    assert_eq!(workers.list_live(now - chrono::Duration::minutes(1)).await?.len(), 2);

    workers.remove_pool("a").await?;
    workers.remove("worker-b-0").await?;
    assert!(workers.list_live(now - chrono::Duration::days(1)).await?.is_empty());

    Ok(())
}

#[cfg(feature = "surrealkv")]
#[tokio::test]
async fn jobs_survive_reopening_the_store() -> Result<(), Box<dyn Error>> {
    use db::DbConfig;
    use db::repositories::JobRepository;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.db");
    let config = DbConfig::surrealkv(path.display().to_string());

    let id = {
        let db = db::connect(&config).await?;
        let repo = JobRepository::new(db, QueueConfig::default());
        repo.enqueue(NewJob::new("echo durable")).await?.id
    };
    // Let the embedded engine release its files.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let db = db::connect(&config).await?;
    let repo = JobRepository::new(db, QueueConfig::default());
    let job = repo.get(id).await?;
    assert_eq!(job.command, "echo durable");
    assert_eq!(job.state, JobState::Pending);

    Ok(())
}
