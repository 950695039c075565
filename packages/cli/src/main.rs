use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actors::{ShellRunner, WorkerPool};
use chrono::{DateTime, Utc};
use clap::Parser;
use db::repositories::{ConfigRepository, JobFilter, JobRepository, WorkerRepository};
use db::{Database, DbConfig, DeadLetterQueue};
use queue_core::{JobEvent, JobId, JobState, NewJob, QueueConfig};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A durable background job queue for shell commands")]
#[command(propagate_version = true)]
struct Args {
    /// Store endpoint: surrealkv://PATH, rocksdb://PATH, ws://HOST:PORT or mem://.
    /// Embedded stores are locked by one process; use a ws:// server to run
    /// workers and submit jobs from separate processes.
    #[arg(long, global = true, env = "QUEUECTL_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a job
    Enqueue(EnqueueArgs),

    /// Worker pool commands
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show job counts per state and live workers
    Status,

    /// List jobs as JSON lines
    List {
        /// Only jobs in this state (pending, processing, completed, failed, dead)
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long, allow_hyphen_values = true)]
        min_priority: Option<i32>,

        #[arg(long, allow_hyphen_values = true)]
        max_priority: Option<i32>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long)]
        offset: Option<usize>,
    },

    /// Dead letter queue commands
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Read or change queue settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

// =============================================================================
// Subcommand Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct EnqueueArgs {
    /// Command line to run through `sh -c`
    #[arg(required_unless_present = "json")]
    command: Option<String>,

    /// Positional arguments passed to the command as $1, $2, ...
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Full job as JSON, e.g. '{"command":"echo hi","priority":5}'
    #[arg(long, conflicts_with = "command")]
    json: Option<String>,

    /// Higher runs first
    #[arg(long, allow_hyphen_values = true)]
    priority: Option<i32>,

    /// Retries allowed after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Execution budget in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Hold the job back for this many seconds
    #[arg(long, conflicts_with = "run_at")]
    delay: Option<u64>,

    /// Hold the job back until this RFC 3339 time
    #[arg(long)]
    run_at: Option<DateTime<Utc>>,
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Run a worker pool until interrupted, then drain it
    Start {
        /// Number of workers (defaults to the `workers` setting)
        #[arg(long, short = 'c')]
        count: Option<usize>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs as JSON lines
    List {
        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long)]
        offset: Option<usize>,
    },
    /// Return a dead job to the queue with a fresh retry budget
    Retry {
        /// The job ID (ULID)
        id: JobId,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Print one setting
    Get { key: String },
    /// Change one setting
    Set { key: String, value: String },
    /// Print all settings as JSON
    Show,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// `~/.queuectl/store`, or `./.queuectl/store` without a home directory.
fn default_store_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".queuectl")
        .join("store")
}

async fn open_store(endpoint: Option<String>) -> Result<Database, Box<dyn Error>> {
    let config = match endpoint {
        Some(endpoint) => DbConfig::endpoint(endpoint),
        None => {
            let path = default_store_path();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            DbConfig::surrealkv(path.display().to_string())
        }
    };

    tracing::debug!(endpoint = %config.endpoint, "Opening store");
    Ok(db::connect(&config).await?)
}

async fn job_repository(db: &Database) -> Result<JobRepository, Box<dyn Error>> {
    let config = ConfigRepository::new(db.clone()).load().await?;
    Ok(JobRepository::new(db.clone(), config))
}

fn build_job(args: EnqueueArgs) -> Result<NewJob, Box<dyn Error>> {
    let mut job = match (args.json, args.command) {
        (Some(json), _) => serde_json::from_str::<NewJob>(&json)?,
        (None, Some(command)) => NewJob::new(command),
        (None, None) => return Err("a command or --json is required".into()),
    };

    if !args.args.is_empty() {
        job.args = args.args;
    }
    if let Some(priority) = args.priority {
        job.priority = priority;
    }
    if let Some(max_retries) = args.max_retries {
        job.max_retries = Some(max_retries);
    }
    if let Some(timeout) = args.timeout {
        job.timeout_secs = Some(timeout);
    }
    if let Some(delay) = args.delay {
        job = job.delayed(Utc::now(), Duration::from_secs(delay));
    }
    if let Some(run_at) = args.run_at {
        job = job.scheduled_at(run_at);
    }
    Ok(job)
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_enqueue(db: &Database, args: EnqueueArgs) -> Result<(), Box<dyn Error>> {
    let jobs = job_repository(db).await?;
    let job = jobs.enqueue(build_job(args)?).await?;

    tracing::info!(
        job_id = %job.id,
        priority = job.priority,
        scheduled_at = %job.scheduled_at,
        "Job enqueued"
    );
    println!("{}", job.id);
    Ok(())
}

async fn handle_worker_start(db: &Database, count: Option<usize>) -> Result<(), Box<dyn Error>> {
    let jobs = job_repository(db).await?;
    let config = jobs.config().clone();
    let count = count.unwrap_or(config.concurrency as usize);

    let (events, mut rx) = broadcast::channel::<JobEvent>(1024);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::info!("{}", event.description()),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let runner = Arc::new(ShellRunner::new(config.kill_grace()));
    let pool = WorkerPool::start_with_events(jobs, runner, count, events).await?;
    tracing::info!(
        pool_id = pool.pool_id(),
        workers = count,
        "Worker pool running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down; waiting for running jobs to finish");

    let status = pool.shutdown().await?;
    tracing::info!(
        claimed = status.claimed,
        completed = status.completed,
        retried = status.retried,
        dead = status.dead,
        "Worker pool stopped"
    );
    Ok(())
}

async fn handle_status(db: &Database) -> Result<(), Box<dyn Error>> {
    let jobs = job_repository(db).await?;
    let stats = jobs.count_by_state().await?;

    for state in JobState::ALL {
        println!("{:<11} {}", state.as_str(), stats.get(state));
    }
    println!("{:<11} {}", "total", stats.total());

    // Pools refresh their rows every heartbeat.
    let window = jobs.config().heartbeat_interval() * 3;
    let since = Utc::now() - chrono::Duration::from_std(window)?;
    let workers = WorkerRepository::new(db.clone()).list_live(since).await?;

    println!();
    println!("active workers: {}", workers.len());
    for worker in workers {
        let job = worker
            .current_job
            .map(|id| id.to_string())
            .unwrap_or_else(|| "idle".to_string());
        println!(
            "  {} (pid {}) {} last seen {}",
            worker.worker_id,
            worker.pid,
            job,
            worker.last_seen.to_rfc3339()
        );
    }
    Ok(())
}

async fn handle_list(db: &Database, filter: JobFilter) -> Result<(), Box<dyn Error>> {
    let jobs = job_repository(db).await?;
    for job in jobs.list(filter).await? {
        println!("{}", serde_json::to_string(&job)?);
    }
    Ok(())
}

async fn handle_dlq(db: &Database, command: DlqCommands) -> Result<(), Box<dyn Error>> {
    let dlq = DeadLetterQueue::new(job_repository(db).await?);
    match command {
        DlqCommands::List { limit, offset } => {
            for job in dlq.list(Some(limit), offset).await? {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        DlqCommands::Retry { id } => {
            let job = dlq.retry(id).await?;
            tracing::info!(job_id = %job.id, "Dead job requeued");
            println!("{}", job.id);
        }
    }
    Ok(())
}

async fn handle_config(db: &Database, command: ConfigCommands) -> Result<(), Box<dyn Error>> {
    let settings = ConfigRepository::new(db.clone());
    match command {
        ConfigCommands::Get { key } => println!("{}", settings.get(&key).await?),
        ConfigCommands::Set { key, value } => {
            let config = settings.set(&key, &value).await?;
            println!("{} = {}", key, config.get(&key)?);
        }
        ConfigCommands::Show => {
            let config: QueueConfig = settings.load().await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let db = open_store(args.db).await?;

    match args.command {
        Commands::Enqueue(enqueue) => handle_enqueue(&db, enqueue).await,
        Commands::Worker {
            command: WorkerCommands::Start { count },
        } => handle_worker_start(&db, count).await,
        Commands::Status => handle_status(&db).await,
        Commands::List {
            state,
            min_priority,
            max_priority,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                state,
                min_priority,
                max_priority,
                limit: Some(limit),
                offset,
            };
            handle_list(&db, filter).await
        }
        Commands::Dlq { command } => handle_dlq(&db, command).await,
        Commands::Config { command } => handle_config(&db, command).await,
    }
}
