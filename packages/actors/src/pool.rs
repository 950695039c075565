//! Worker pool: supervises workers, reclaims orphaned jobs and reports status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::repositories::{JobRepository, WorkerInfo, WorkerRepository};
use queue_core::{JobEvent, JobId};
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::messages::{
    JobOutcome, PoolError, PoolMessage, PoolStatus, WorkerMessage, WorkerReport, WorkerStatus,
};
use crate::runner::JobRunner;
use crate::worker_actor::{WorkerActor, WorkerArgs, WorkerSettings};

/// How long `status()` waits for the pool to answer.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

struct WorkerEntry {
    worker_id: String,
    actor: ActorRef<WorkerMessage>,
    current_job: Option<JobId>,
    started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    claimed: u64,
    completed: u64,
    retried: u64,
    dead: u64,
    conflicts: u64,
    restarts: u64,
}

/// Pool actor arguments.
pub struct PoolArgs {
    pub pool_id: String,
    pub jobs: JobRepository,
    pub runner: Arc<dyn JobRunner>,
    pub workers: usize,
    pub events: broadcast::Sender<JobEvent>,
}

/// State for the pool actor.
pub struct PoolState {
    pool_id: String,
    jobs: JobRepository,
    worker_rows: WorkerRepository,
    runner: Arc<dyn JobRunner>,
    settings: WorkerSettings,
    target: usize,
    events: broadcast::Sender<JobEvent>,
    workers: HashMap<ActorId, WorkerEntry>,
    counters: Counters,
    next_index: u64,
    draining: bool,
    drain_replies: Vec<RpcReplyPort<PoolStatus>>,
}

impl PoolState {
    /// A worker is considered alive if it reported within this window.
    fn liveness_window(&self) -> chrono::Duration {
        let slowest = self.settings.poll_interval.max(self.settings.heartbeat) * 3;
        chrono::Duration::from_std(slowest).unwrap_or(chrono::Duration::MAX)
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self) -> PoolStatus {
        let now = Utc::now();
        let window = self.liveness_window();
        let mut workers: Vec<WorkerStatus> = self
            .workers
            .values()
            .map(|w| WorkerStatus {
                worker_id: w.worker_id.clone(),
                current_job: w.current_job,
                last_seen: w.last_seen,
                alive: now - w.last_seen <= window,
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        PoolStatus {
            pool_id: self.pool_id.clone(),
            workers,
            claimed: self.counters.claimed,
            completed: self.counters.completed,
            retried: self.counters.retried,
            dead: self.counters.dead,
            conflicts: self.counters.conflicts,
            restarts: self.counters.restarts,
            draining: self.draining,
        }
    }
}

async fn spawn_worker(
    myself: &ActorRef<PoolMessage>,
    state: &mut PoolState,
) -> Result<(), ActorProcessingErr> {
    let worker_id = format!("worker-{}-{}", state.pool_id, state.next_index);
    state.next_index += 1;

    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        jobs: state.jobs.clone(),
        runner: state.runner.clone(),
        pool: myself.clone(),
        events: state.events.clone(),
        settings: state.settings,
    };

    let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    let now = Utc::now();
    state.workers.insert(
        actor.get_id(),
        WorkerEntry {
            worker_id: worker_id.clone(),
            actor,
            current_job: None,
            started_at: now,
            last_seen: now,
        },
    );
    state.emit(JobEvent::WorkerStarted {
        worker_id,
        timestamp: now,
    });

    Ok(())
}

/// Reclaim expired leases and publish worker liveness for other processes.
async fn housekeeping(state: &mut PoolState) {
    match state.jobs.reap_expired_leases().await {
        Ok(report) if !report.is_empty() => {
            tracing::info!(
                pool_id = %state.pool_id,
                requeued = report.requeued.len(),
                dead = report.dead.len(),
                "Reclaimed expired leases"
            );
            state.counters.dead += report.dead.len() as u64;
            state.emit(JobEvent::LeasesReaped {
                requeued: report.requeued.len() as u64,
                dead: report.dead.len() as u64,
                timestamp: Utc::now(),
            });
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(pool_id = %state.pool_id, error = %e, "Lease sweep failed"),
    }

    let pid = std::process::id();
    for worker in state.workers.values() {
        let row = WorkerInfo {
            worker_id: worker.worker_id.clone(),
            pool_id: state.pool_id.clone(),
            pid,
            current_job: worker.current_job,
            started_at: worker.started_at,
            last_seen: worker.last_seen,
        };
        if let Err(e) = state.worker_rows.upsert(&row).await {
            tracing::warn!(
                worker_id = %worker.worker_id,
                error = %e,
                "Failed to publish worker status"
            );
        }
    }
}

async fn forget_worker(state: &PoolState, worker_id: &str) {
    if let Err(e) = state.worker_rows.remove(worker_id).await {
        tracing::warn!(worker_id, error = %e, "Failed to remove worker row");
    }
}

/// Pool actor that supervises workers.
pub struct PoolActor;

impl Actor for PoolActor {
    type Msg = PoolMessage;
    type State = PoolState;
    type Arguments = PoolArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(pool_id = %args.pool_id, workers = args.workers, "Starting worker pool");

        let settings = WorkerSettings::from(args.jobs.config());

        // Start periodic tick
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(settings.heartbeat);
            loop {
                interval.tick().await;
                if myself_clone.send_message(PoolMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(PoolState {
            pool_id: args.pool_id,
            worker_rows: WorkerRepository::new(args.jobs.database().clone()),
            jobs: args.jobs,
            runner: args.runner,
            settings,
            target: args.workers,
            events: args.events,
            workers: HashMap::new(),
            counters: Counters::default(),
            next_index: 0,
            draining: false,
            drain_replies: Vec::new(),
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for _ in 0..state.target {
            spawn_worker(&myself, state).await?;
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::Report { worker_id, report } => {
                let Some(entry) = state
                    .workers
                    .values_mut()
                    .find(|w| w.worker_id == worker_id)
                else {
                    return Ok(());
                };
                entry.last_seen = Utc::now();
                match report {
                    WorkerReport::Idle => {}
                    WorkerReport::Claimed { job_id, .. } => {
                        entry.current_job = Some(job_id);
                        state.counters.claimed += 1;
                    }
                    WorkerReport::Heartbeat { job_id } => {
                        entry.current_job = Some(job_id);
                    }
                    WorkerReport::Finished { outcome, .. } => {
                        entry.current_job = None;
                        let counter = match outcome {
                            JobOutcome::Completed => &mut state.counters.completed,
                            JobOutcome::Retrying => &mut state.counters.retried,
                            JobOutcome::Dead => &mut state.counters.dead,
                            JobOutcome::LeaseLost => &mut state.counters.conflicts,
                            JobOutcome::StoreError => return Ok(()),
                        };
                        *counter += 1;
                    }
                }
            }

            PoolMessage::GetStatus { reply } => {
                let _ = reply.send(state.status());
            }

            PoolMessage::Drain { reply } => {
                if !state.draining {
                    tracing::info!(pool_id = %state.pool_id, "Draining worker pool");
                    state.draining = true;
                    for worker in state.workers.values() {
                        worker.actor.stop(Some("pool draining".to_string()));
                    }
                }
                state.drain_replies.extend(reply);
                if state.workers.is_empty() {
                    let status = state.status();
                    for reply in state.drain_replies.drain(..) {
                        let _ = reply.send(status.clone());
                    }
                    myself.stop(None);
                }
            }

            PoolMessage::Tick => {
                if !state.draining {
                    housekeeping(state).await;
                }
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(worker) = state.workers.remove(&cell.get_id()) {
                    tracing::info!(worker_id = %worker.worker_id, ?reason, "Worker terminated");
                    forget_worker(state, &worker.worker_id).await;
                    state.emit(JobEvent::WorkerStopped {
                        worker_id: worker.worker_id,
                        timestamp: Utc::now(),
                    });
                }
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                if let Some(worker) = state.workers.remove(&cell.get_id()) {
                    tracing::error!(
                        worker_id = %worker.worker_id,
                        job_id = ?worker.current_job,
                        error = %err,
                        "Worker crashed; its job will be reclaimed when the lease expires"
                    );
                    forget_worker(state, &worker.worker_id).await;
                    state.emit(JobEvent::WorkerCrashed {
                        worker_id: worker.worker_id,
                        error: err.to_string(),
                        timestamp: Utc::now(),
                    });
                    if !state.draining {
                        state.counters.restarts += 1;
                        spawn_worker(&myself, state).await?;
                    }
                }
            }
            _ => {}
        }

        // Supervision events overtake queued messages; going through the
        // mailbox lets the last workers' reports land before the pool stops.
        if state.draining && state.workers.is_empty() {
            let _ = myself.send_message(PoolMessage::Drain { reply: None });
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Err(e) = state.worker_rows.remove_pool(&state.pool_id).await {
            tracing::warn!(pool_id = %state.pool_id, error = %e, "Failed to clear worker rows");
        }
        tracing::info!(pool_id = %state.pool_id, "Worker pool stopped");
        Ok(())
    }
}

/// Handle to a running worker pool.
pub struct WorkerPool {
    pool_id: String,
    actor: ActorRef<PoolMessage>,
    handle: JoinHandle<()>,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerPool {
    /// Start `workers` workers claiming from `jobs`.
    pub async fn start(
        jobs: JobRepository,
        runner: Arc<dyn JobRunner>,
        workers: usize,
    ) -> Result<Self, PoolError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::start_with_events(jobs, runner, workers, events).await
    }

    /// Like [`WorkerPool::start`], publishing to an existing event channel so
    /// subscribers see the workers start.
    pub async fn start_with_events(
        jobs: JobRepository,
        runner: Arc<dyn JobRunner>,
        workers: usize,
        events: broadcast::Sender<JobEvent>,
    ) -> Result<Self, PoolError> {
        jobs.config().validate()?;

        let pool_id = Ulid::new().to_string().to_lowercase();
        let args = PoolArgs {
            pool_id: pool_id.clone(),
            jobs,
            runner,
            workers: workers.max(1),
            events: events.clone(),
        };
        let (actor, handle) = Actor::spawn(None, PoolActor, args).await?;

        Ok(Self {
            pool_id,
            actor,
            handle,
            events,
        })
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Snapshot of worker liveness and counters.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| PoolMessage::GetStatus { reply },
            Some(STATUS_TIMEOUT),
        )
        .await
        .map_err(|e| PoolError::NotRunning(e.to_string()))?;

        match result {
            ractor::rpc::CallResult::Success(status) => Ok(status),
            ractor::rpc::CallResult::Timeout => Err(PoolError::Timeout),
            ractor::rpc::CallResult::SenderError => {
                Err(PoolError::NotRunning("status reply dropped".into()))
            }
        }
    }

    /// Stop claiming new jobs, wait for running ones to finish, then stop.
    ///
    /// Returns the final counters, including jobs that finished while draining.
    pub async fn shutdown(self) -> Result<PoolStatus, PoolError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        let drain = PoolMessage::Drain {
            reply: Some(tx.into()),
        };
        if self.actor.send_message(drain).is_err() {
            tracing::debug!(pool_id = %self.pool_id, "Pool already stopped");
        }
        self.handle.await?;
        rx.await
            .map_err(|_| PoolError::NotRunning("pool stopped before reporting".into()))
    }
}
