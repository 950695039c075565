//! Timeout-enforcing execution of shell commands.
//!
//! Each job runs as `sh -c` in its own process group so that a timeout can
//! take down the whole tree the command spawned, not just the shell.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Maximum captured size per stream (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// How long to wait for the output pipes to drain after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The deadline fired and the process group was terminated.
    Timeout,
    /// Non-zero exit; `None` when killed by a signal.
    ExitStatus(Option<i32>),
    /// The command could not be started or awaited.
    Spawn(String),
}

/// Result of running one job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `None` means exit status 0.
    pub failure: Option<FailureKind>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            failure: None,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn failure(kind: FailureKind, stderr: impl Into<String>) -> Self {
        let exit_code = match &kind {
            FailureKind::ExitStatus(code) => *code,
            _ => None,
        };
        Self {
            failure: Some(kind),
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            duration: after,
            ..Self::failure(FailureKind::Timeout, "")
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Captured output for the job record, or `None` if nothing was printed.
    pub fn output_log(&self) -> Option<String> {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        let output = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            format!("--- stderr ---\n{}", stderr)
        } else {
            format!("{}\n\n--- stderr ---\n{}", stdout, stderr)
        };
        (!output.is_empty()).then_some(output)
    }

    /// Error text for a failed attempt, classified by kind.
    pub fn error_message(&self) -> String {
        let summary = match &self.failure {
            None => return String::new(),
            Some(FailureKind::Timeout) => {
                format!("timed out after {:.1}s", self.duration.as_secs_f64())
            }
            Some(FailureKind::ExitStatus(Some(code))) => format!("exited with status {}", code),
            Some(FailureKind::ExitStatus(None)) => "terminated by signal".to_string(),
            Some(FailureKind::Spawn(reason)) => format!("failed to start: {}", reason),
        };
        match self.stderr.trim().lines().last() {
            Some(line) if !matches!(self.failure, Some(FailureKind::Spawn(_))) => {
                format!("{}: {}", summary, line)
            }
            _ => summary,
        }
    }
}

/// Runs commands under a deadline.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    kill_grace: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl CommandExecutor {
    /// Create an executor that waits `kill_grace` between SIGTERM and SIGKILL.
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            shell: "sh".to_string(),
            kill_grace,
        }
    }

    /// Run `command` with positional `args`, killing it after `timeout`.
    pub async fn run(&self, command: &str, args: &[String], timeout: Duration) -> ExecutionOutcome {
        let started = Instant::now();

        let script = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} \"$@\"", command)
        };
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .arg("sh")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command, error = %e, "Failed to spawn command");
                return ExecutionOutcome::failure(FailureKind::Spawn(e.to_string()), "");
            }
        };

        let stdout = child.stdout.take().map(|out| tokio::spawn(read_capped(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_capped(err)));

        let (failure, exit_code) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => (None, status.code()),
            Ok(Ok(status)) => (Some(FailureKind::ExitStatus(status.code())), status.code()),
            Ok(Err(e)) => (Some(FailureKind::Spawn(e.to_string())), None),
            Err(_) => {
                tracing::warn!(command, timeout_secs = timeout.as_secs_f64(), "Command timed out");
                self.terminate(&mut child).await;
                (Some(FailureKind::Timeout), None)
            }
        };

        let (stdout, stderr) = futures_util::future::join(drain(stdout), drain(stderr)).await;

        ExecutionOutcome {
            failure,
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
        }
    }

    /// SIGTERM the process group, then SIGKILL it if it outlives the grace period.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::Signal;

            signal_group(Signal::SIGTERM, pid);
            if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
                // The shell is gone; make sure nothing it left behind survives.
                signal_group(Signal::SIGKILL, pid);
                return;
            }
            tracing::warn!(pid, "Process group ignored SIGTERM, killing");
            signal_group(Signal::SIGKILL, pid);
        }
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "Kill after timeout failed");
        }
    }
}

#[cfg(unix)]
fn signal_group(signal: nix::sys::signal::Signal, pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    // ESRCH just means the whole group already exited.
    if let Err(e) = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(raw), signal) {
        tracing::debug!(?signal, pgid, error = %e, "Failed to signal process group");
    }
}

/// Read a stream to the end, keeping at most `MAX_OUTPUT_SIZE` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_SIZE.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}
