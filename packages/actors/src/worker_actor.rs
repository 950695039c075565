//! Worker actor: claims jobs from the store and runs them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use db::DbError;
use db::repositories::JobRepository;
use queue_core::{Job, JobEvent, JobId, JobState, QueueConfig};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::executor::ExecutionOutcome;
use crate::messages::{JobOutcome, PoolMessage, WorkerMessage, WorkerReport};
use crate::runner::JobRunner;

/// Slack granted beyond a job's timeout before the worker gives up on its runner.
const RUNNER_BACKSTOP: Duration = Duration::from_secs(5);

/// Timing knobs taken from the queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub lease: Duration,
    pub heartbeat: Duration,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            lease: config.lease_duration(),
            heartbeat: config.heartbeat_interval(),
            poll_interval: config.poll_interval(),
            kill_grace: config.kill_grace(),
        }
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub jobs: JobRepository,
    pub runner: Arc<dyn JobRunner>,
    pub pool: ActorRef<PoolMessage>,
    pub events: broadcast::Sender<JobEvent>,
    pub settings: WorkerSettings,
}

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID, also the lease owner.
    pub worker_id: String,
    jobs: JobRepository,
    runner: Arc<dyn JobRunner>,
    pool: ActorRef<PoolMessage>,
    events: broadcast::Sender<JobEvent>,
    settings: WorkerSettings,
}

impl WorkerActorState {
    fn report(&self, report: WorkerReport) {
        // The pool may already be gone during shutdown.
        let _ = self.pool.send_message(PoolMessage::Report {
            worker_id: self.worker_id.clone(),
            report,
        });
    }

    fn emit(&self, event: JobEvent) {
        tracing::debug!(worker_id = %self.worker_id, "{}", event.description());
        let _ = self.events.send(event);
    }
}

/// Renews a job's lease in the background; stops when dropped.
struct HeartbeatGuard(JoinHandle<()>);

impl HeartbeatGuard {
    fn spawn(state: &WorkerActorState, job_id: JobId) -> Self {
        let jobs = state.jobs.clone();
        let pool = state.pool.clone();
        let worker_id = state.worker_id.clone();
        let settings = state.settings;

        Self(tokio::spawn(async move {
            loop {
                tokio::time::sleep(settings.heartbeat).await;
                match jobs.heartbeat(job_id, &worker_id, settings.lease).await {
                    Ok(_) => {
                        let _ = pool.send_message(PoolMessage::Report {
                            worker_id: worker_id.clone(),
                            report: WorkerReport::Heartbeat { job_id },
                        });
                    }
                    Err(DbError::Conflict { owner, .. }) => {
                        tracing::error!(
                            %job_id,
                            %worker_id,
                            ?owner,
                            "Lease lost while job was running"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%job_id, %worker_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }))
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Worker actor that executes jobs.
pub struct WorkerActor;

impl WorkerActor {
    /// Run one claimed job to completion and report the attempt.
    async fn process(state: &WorkerActorState, job: Job) {
        let job_id = job.id;
        let worker_id = state.worker_id.as_str();

        state.report(WorkerReport::Claimed {
            job_id,
            attempt: job.attempts,
        });
        state.emit(JobEvent::JobClaimed {
            job_id,
            worker_id: worker_id.to_string(),
            attempt: job.attempts,
            timestamp: Utc::now(),
        });
        tracing::info!(
            %job_id,
            worker_id,
            attempt = job.attempts,
            command = %job.command,
            "Running job"
        );

        let started = Instant::now();
        let outcome = {
            let _heartbeat = HeartbeatGuard::spawn(state, job_id);
            let budget = job.timeout() + state.settings.kill_grace + RUNNER_BACKSTOP;
            match tokio::time::timeout(budget, state.runner.run(&job)).await {
                Ok(outcome) => outcome,
                Err(_) => ExecutionOutcome::timed_out(budget),
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let reported = if outcome.is_success() {
            state
                .jobs
                .mark_completed(job_id, worker_id, outcome.output_log())
                .await
        } else {
            state
                .jobs
                .mark_failed(job_id, worker_id, &outcome.error_message(), outcome.output_log())
                .await
        };

        let result = match reported {
            Ok(updated) => match updated.state {
                JobState::Completed => {
                    state.emit(JobEvent::JobCompleted {
                        job_id,
                        worker_id: worker_id.to_string(),
                        attempts: updated.attempts,
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    JobOutcome::Completed
                }
                JobState::Dead => {
                    state.emit(JobEvent::JobDead {
                        job_id,
                        worker_id: Some(worker_id.to_string()),
                        attempts: updated.attempts,
                        error: updated.last_error.unwrap_or_default(),
                        timestamp: Utc::now(),
                    });
                    JobOutcome::Dead
                }
                _ => {
                    state.emit(JobEvent::JobRetrying {
                        job_id,
                        worker_id: worker_id.to_string(),
                        attempts: updated.attempts,
                        error: updated.last_error.unwrap_or_default(),
                        retry_at: updated.scheduled_at,
                        timestamp: Utc::now(),
                    });
                    JobOutcome::Retrying
                }
            },
            Err(DbError::Conflict { owner, .. }) => {
                tracing::error!(
                    %job_id,
                    worker_id,
                    ?owner,
                    "Lease lost; discarding result of this attempt"
                );
                state.emit(JobEvent::LeaseLost {
                    job_id,
                    worker_id: worker_id.to_string(),
                    timestamp: Utc::now(),
                });
                JobOutcome::LeaseLost
            }
            Err(e) => {
                tracing::error!(%job_id, worker_id, error = %e, "Failed to record job outcome");
                JobOutcome::StoreError
            }
        };

        state.report(WorkerReport::Finished {
            job_id,
            outcome: result,
        });
    }
}

/// Send a poll after `delay`, unless the worker has stopped by then.
fn schedule_poll(myself: &ActorRef<WorkerMessage>, delay: Duration) {
    let myself = myself.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = myself.send_message(WorkerMessage::Poll);
    });
}

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            jobs: args.jobs,
            runner: args.runner,
            pool: args.pool,
            events: args.events,
            settings: args.settings,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                match state
                    .jobs
                    .claim_next(&state.worker_id, state.settings.lease)
                    .await
                {
                    Ok(Some(job)) => {
                        Self::process(state, job).await;
                        // More work may be waiting; look again straight away.
                        myself.send_message(WorkerMessage::Poll)?;
                    }
                    Ok(None) => {
                        state.report(WorkerReport::Idle);
                        schedule_poll(&myself, state.settings.poll_interval);
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %state.worker_id, error = %e, "Claim failed");
                        state.report(WorkerReport::Idle);
                        schedule_poll(&myself, state.settings.poll_interval);
                    }
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker stopped: {}", state.worker_id);
        Ok(())
    }
}
