#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;

use common::{LEASE, secs, setup_db, setup_repo};
use db::DbError;
use db::repositories::JobRepository;
use queue_core::{Clock, JobState, NewJob, QueueConfig, ValidationError};

#[tokio::test]
async fn claims_highest_priority_then_oldest() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;

    let low = repo.enqueue(NewJob::new("echo low").with_priority(1)).await?;
    clock.advance(secs(1));
    let first_high = repo.enqueue(NewJob::new("echo high-1").with_priority(5)).await?;
    clock.advance(secs(1));
    let second_high = repo.enqueue(NewJob::new("echo high-2").with_priority(5)).await?;

    let order = [
        repo.claim_next("w1", LEASE).await?.map(|j| j.id),
        repo.claim_next("w1", LEASE).await?.map(|j| j.id),
        repo.claim_next("w1", LEASE).await?.map(|j| j.id),
    ];
    assert_eq!(order, [Some(first_high.id), Some(second_high.id), Some(low.id)]);
    assert!(repo.claim_next("w1", LEASE).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn claim_sets_lease_and_increments_attempts() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let job = repo.enqueue(NewJob::new("true")).await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.lease.is_none());

    let claimed = repo.claim_next("worker-a", LEASE).await?.ok_or("no job")?;
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.attempts, 1);
    let lease = claimed.lease.ok_or("no lease")?;
    assert_eq!(lease.owner, "worker-a");
    assert_eq!(lease.expires_at, clock.now() + chrono::Duration::seconds(30));

    Ok(())
}

#[tokio::test]
async fn scheduled_job_waits_until_due() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let job = repo
        .enqueue(NewJob::new("echo later").delayed(clock.now(), secs(60)))
        .await?;

    assert!(repo.claim_next("w1", LEASE).await?.is_none());

    clock.advance(secs(59));
    assert!(repo.claim_next("w1", LEASE).await?.is_none());

    clock.advance(secs(1));
    let claimed = repo.claim_next("w1", LEASE).await?.ok_or("job not due")?;
    assert_eq!(claimed.id, job.id);

    Ok(())
}

#[tokio::test]
async fn expired_lease_is_reclaimed_but_not_sooner() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let job = repo.enqueue(NewJob::new("sleep 100")).await?;

    repo.claim_next("crashed", LEASE).await?.ok_or("no job")?;
    assert!(repo.claim_next("rescuer", LEASE).await?.is_none());

    clock.advance(LEASE);
    assert!(
        repo.claim_next("rescuer", LEASE).await?.is_none(),
        "lease is live up to and including its expiry instant"
    );

    clock.advance(secs(1));
    let reclaimed = repo.claim_next("rescuer", LEASE).await?.ok_or("not reclaimed")?;
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.lease_owner(), Some("rescuer"));

    // The stale worker comes back and must not overwrite the new claim.
    let stale = repo.mark_completed(job.id, "crashed", None).await;
    match stale {
        Err(DbError::Conflict { job_id, owner }) => {
            assert_eq!(job_id, job.id);
            assert_eq!(owner.as_deref(), Some("rescuer"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    let stale_failure = repo.mark_failed(job.id, "crashed", "late", None).await;
    assert!(matches!(stale_failure, Err(DbError::Conflict { .. })));

    let current = repo.get(job.id).await?;
    assert_eq!(current.state, JobState::Processing);
    assert_eq!(current.attempts, 2);

    Ok(())
}

#[tokio::test]
async fn successful_job_completes_on_first_attempt() -> Result<(), Box<dyn Error>> {
    let (repo, _clock) = setup_repo(QueueConfig::default()).await?;
    let job = repo.enqueue(NewJob::new("exit 0").with_max_retries(3)).await?;

    let claimed = repo.claim_next("w1", LEASE).await?.ok_or("no job")?;
    let done = repo
        .mark_completed(claimed.id, "w1", Some("ok".to_string()))
        .await?;

    assert_eq!(done.id, job.id);
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts, 1);
    assert!(done.lease.is_none());
    assert_eq!(done.output_log.as_deref(), Some("ok"));
    assert!(repo.claim_next("w1", LEASE).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn failing_job_backs_off_then_goes_dead() -> Result<(), Box<dyn Error>> {
    let config = QueueConfig {
        backoff_base: 2.0,
        ..QueueConfig::default()
    };
    let (repo, clock) = setup_repo(config).await?;
    let job = repo.enqueue(NewJob::new("exit 1").with_max_retries(2)).await?;

    // attempt 1 -> retry in 2s, attempt 2 -> retry in 4s
    for (attempt, delay) in [(1u32, 2u64), (2, 4)] {
        let claimed = repo.claim_next("w1", LEASE).await?.ok_or("job not eligible")?;
        assert_eq!(claimed.attempts, attempt);

        let failed = repo
            .mark_failed(job.id, "w1", "exited with status 1", None)
            .await?;
        assert_eq!(failed.state, JobState::Pending);
        assert_eq!(failed.attempts, attempt);
        assert!(failed.lease.is_none());
        assert_eq!(failed.last_error.as_deref(), Some("exited with status 1"));

        clock.advance(secs(delay - 1));
        assert!(repo.claim_next("w1", LEASE).await?.is_none(), "claimed during backoff");
        clock.advance(secs(1));
    }

    let claimed = repo.claim_next("w1", LEASE).await?.ok_or("job not eligible")?;
    assert_eq!(claimed.attempts, 3);
    let dead = repo
        .mark_failed(job.id, "w1", "exited with status 1", Some("boom".into()))
        .await?;
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.output_log.as_deref(), Some("boom"));

    clock.advance(secs(3600));
    assert!(repo.claim_next("w1", LEASE).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn heartbeat_extends_only_for_the_owner() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let job = repo.enqueue(NewJob::new("sleep 60")).await?;
    repo.claim_next("w1", secs(10)).await?.ok_or("no job")?;

    clock.advance(secs(8));
    let renewed = repo.heartbeat(job.id, "w1", secs(10)).await?;
    let expires = renewed.lease.ok_or("no lease")?.expires_at;
    assert_eq!(expires, clock.now() + chrono::Duration::seconds(10));

    clock.advance(secs(8));
    assert!(repo.claim_next("w2", secs(10)).await?.is_none());

    let intruder = repo.heartbeat(job.id, "w2", secs(10)).await;
    assert!(matches!(intruder, Err(DbError::Conflict { .. })));

    Ok(())
}

#[tokio::test]
async fn exhausted_orphans_are_not_reclaimed_but_reaped_dead() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let last_chance = repo.enqueue(NewJob::new("crash").with_max_retries(0)).await?;
    clock.advance(secs(1));
    let retryable = repo.enqueue(NewJob::new("crash").with_max_retries(2)).await?;

    repo.claim_next("w1", LEASE).await?.ok_or("no job")?;
    repo.claim_next("w2", LEASE).await?.ok_or("no job")?;
    clock.advance(LEASE + secs(1));

    // Only the job with attempts left is claimable directly.
    let reclaimed = repo.claim_next("w3", LEASE).await?.ok_or("no orphan reclaimed")?;
    assert_eq!(reclaimed.id, retryable.id);
    assert!(repo.claim_next("w3", LEASE).await?.is_none());

    let report = repo.reap_expired_leases().await?;
    assert_eq!(report.dead, vec![last_chance.id]);
    assert!(report.requeued.is_empty());

    let dead = repo.get(last_chance.id).await?;
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 1);
    assert!(dead.lease.is_none());
    assert!(dead.last_error.is_some());

    Ok(())
}

#[tokio::test]
async fn reaper_requeues_orphans_without_touching_attempts() -> Result<(), Box<dyn Error>> {
    let (repo, clock) = setup_repo(QueueConfig::default()).await?;
    let job = repo.enqueue(NewJob::new("crash").with_max_retries(2)).await?;
    repo.claim_next("w1", LEASE).await?.ok_or("no job")?;

    assert!(repo.reap_expired_leases().await?.is_empty());

    clock.advance(LEASE + secs(1));
    let report = repo.reap_expired_leases().await?;
    assert_eq!(report.requeued, vec![job.id]);

    let pending = repo.get(job.id).await?;
    assert_eq!(pending.state, JobState::Pending);
    assert_eq!(pending.attempts, 1);
    assert!(pending.lease.is_none());

    Ok(())
}

#[tokio::test]
async fn enqueue_validates_and_fills_defaults() -> Result<(), Box<dyn Error>> {
    let config = QueueConfig {
        max_retries: 5,
        default_timeout_secs: 42,
        ..QueueConfig::default()
    };
    let (repo, _clock) = setup_repo(config).await?;

    let rejected = repo.enqueue(NewJob::new("  ")).await;
    assert!(matches!(
        rejected,
        Err(DbError::Validation(ValidationError::MissingCommand))
    ));

    let job = repo.enqueue(NewJob::new("echo").with_args(["a", "b c"])).await?;
    assert_eq!(job.max_retries, 5);
    assert_eq!(job.timeout_secs, 42);
    assert_eq!(job.args, vec!["a".to_string(), "b c".to_string()]);

    let loaded = repo.get(job.id).await?;
    assert_eq!(loaded, job);

    Ok(())
}

#[tokio::test]
async fn unknown_job_reports_not_found() -> Result<(), Box<dyn Error>> {
    let (repo, _clock) = setup_repo(QueueConfig::default()).await?;
    let id = queue_core::JobId::new();

    assert!(matches!(repo.get(id).await, Err(DbError::NotFound(_))));
    assert!(matches!(
        repo.mark_completed(id, "w1", None).await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        repo.heartbeat(id, "w1", LEASE).await,
        Err(DbError::NotFound(_))
    ));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_job() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let seed = JobRepository::new(db.clone(), QueueConfig::default());
    for n in 0..24 {
        seed.enqueue(NewJob::new(format!("echo {n}")).with_priority(n % 3)).await?;
    }

    // Independent repositories share nothing but the store, like separate processes.
    let mut tasks = tokio::task::JoinSet::new();
    for w in 0..6 {
        let repo = JobRepository::new(db.clone(), QueueConfig::default());
        tasks.spawn(async move {
            let worker = format!("worker-{w}");
            let mut claimed = Vec::new();
            loop {
                match repo.claim_next(&worker, LEASE).await {
                    Ok(Some(job)) => claimed.push(job.id),
                    Ok(None) => break,
                    Err(DbError::Contention { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(claimed)
        });
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    while let Some(result) = tasks.join_next().await {
        for id in result?? {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 24);

    let stats = seed.count_by_state().await?;
    assert_eq!(stats.processing, 24);
    assert_eq!(stats.pending, 0);

    Ok(())
}
