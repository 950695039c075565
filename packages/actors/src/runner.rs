//! Job runner trait: how a worker turns a claimed job into an outcome.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use queue_core::Job;

use crate::executor::{CommandExecutor, ExecutionOutcome};

/// Future type for async job runners.
pub type RunFuture = Pin<Box<dyn Future<Output = ExecutionOutcome> + Send>>;

/// Executes a claimed job.
///
/// Implementations enforce the job's timeout themselves; the worker only
/// applies a backstop in case a runner never returns.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: &Job) -> RunFuture;
}

/// Runs the job's command through the shell.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    executor: CommandExecutor,
}

impl ShellRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            executor: CommandExecutor::new(kill_grace),
        }
    }
}

impl JobRunner for ShellRunner {
    fn run(&self, job: &Job) -> RunFuture {
        let executor = self.executor.clone();
        let command = job.command.clone();
        let args = job.args.clone();
        let timeout = job.timeout();
        Box::pin(async move { executor.run(&command, &args, timeout).await })
    }
}

/// A simple function-based job runner.
pub struct FnRunner<F>
where
    F: Fn(&Job) -> RunFuture + Send + Sync + 'static,
{
    runner: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&Job) -> RunFuture + Send + Sync + 'static,
{
    /// Create a new function-based runner.
    pub fn new(runner: F) -> Self {
        Self { runner }
    }
}

impl<F> JobRunner for FnRunner<F>
where
    F: Fn(&Job) -> RunFuture + Send + Sync + 'static,
{
    fn run(&self, job: &Job) -> RunFuture {
        (self.runner)(job)
    }
}
