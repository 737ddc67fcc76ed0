//! Worker process spawning and supervision.
//!
//! The worker is an external program invoked as
//! `<program> <args..> --start-url <url> --max-items <n> --run-id <id>`.
//! Each spawned process gets a supervisor task that forwards its output to
//! the log, waits for exit (or a kill request) and hands the exit event to
//! the lifecycle reconciler.

use std::process::{ExitStatus, Stdio};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::ExecutorConfig;
use crate::error::{Result, RunschedError};
use crate::lifecycle::record_exit;
use crate::store::{Database, RunStatus};

/// What an executor needs to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub run_id: i64,
    pub source_id: i64,
    pub url: String,
    pub max_items: u64,
}

/// Exit event of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub run_id: i64,
    /// None when the process was killed by a signal
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn from_status(run_id: i64, status: ExitStatus) -> Self {
        Self {
            run_id,
            code: status.code(),
        }
    }

    /// Terminal run status and error message for this exit.
    pub fn outcome(&self) -> (RunStatus, Option<String>) {
        match self.code {
            Some(0) => (RunStatus::Completed, None),
            Some(code) => (RunStatus::Error, Some(format!("exit code {}", code))),
            None => (RunStatus::Error, Some("terminated by signal".to_string())),
        }
    }
}

/// Build the worker command line for a run.
pub fn worker_command(config: &ExecutorConfig, request: &StartRequest) -> Command {
    let mut cmd = Command::new(&config.worker_program);
    cmd.args(&config.worker_args)
        .arg("--start-url")
        .arg(&request.url)
        .arg("--max-items")
        .arg(request.max_items.to_string())
        .arg("--run-id")
        .arg(request.run_id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Spawn the worker process. Must be called within a Tokio runtime.
pub fn spawn_worker(config: &ExecutorConfig, request: &StartRequest) -> Result<Child> {
    worker_command(config, request).spawn().map_err(|e| {
        RunschedError::Spawn(format!(
            "failed to start '{}' for run {}: {}",
            config.worker_program, request.run_id, e
        ))
    })
}

/// Wait for a worker to exit and report the exit to the reconciler.
///
/// A message on `kill` terminates the process first; the resulting exit is
/// still reported, and the reconciler ignores it if the run is already
/// terminal.
pub async fn supervise(mut child: Child, run_id: i64, db: Database, kill: Option<oneshot::Receiver<()>>) -> WorkerExit {
    let mut forwarders = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(stdout, run_id, false)));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(stderr, run_id, true)));
    }

    let status = match kill {
        Some(kill) => {
            tokio::select! {
                status = child.wait() => status,
                // A dropped sender only disables this branch
                Ok(()) = kill => {
                    log::info!("Terminating worker for run {}", run_id);
                    if let Err(e) = child.start_kill() {
                        log::warn!("Failed to signal worker for run {}: {}", run_id, e);
                    }
                    child.wait().await
                }
            }
        }
        None => child.wait().await,
    };

    for forwarder in forwarders {
        let _ = forwarder.await;
    }

    let exit = match status {
        Ok(status) => WorkerExit::from_status(run_id, status),
        Err(e) => {
            log::error!("Failed to wait for worker of run {}: {}", run_id, e);
            WorkerExit { run_id, code: None }
        }
    };
    tracing::info!(run_id, code = ?exit.code, "Worker exited");

    report_exit(db, exit).await;
    exit
}

/// Hand an exit event to the reconciler on a fresh store session.
pub async fn report_exit(db: Database, exit: WorkerExit) {
    let result = tokio::task::spawn_blocking(move || {
        let store = db.session()?;
        record_exit(&store, &exit, Utc::now())
    })
    .await;

    match result {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => log::info!("Ignored exit of run {}: run already terminal", exit.run_id),
        Ok(Err(e)) => log::error!("Failed to record exit of run {}: {}", exit.run_id, e),
        Err(e) => log::error!("Exit recording task for run {} panicked: {}", exit.run_id, e),
    }
}

async fn forward_lines<R>(reader: R, run_id: i64, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    log::warn!("[run {}] {}", run_id, line);
                } else {
                    log::info!("[run {}] {}", run_id, line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("Stopped reading worker output of run {}: {}", run_id, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StartRequest {
        StartRequest {
            run_id: 12,
            source_id: 3,
            url: "https://savee.it/pop".to_string(),
            max_items: 50,
        }
    }

    #[test]
    fn test_exit_outcomes() {
        let ok = WorkerExit { run_id: 1, code: Some(0) };
        assert_eq!(ok.outcome(), (RunStatus::Completed, None));

        let failed = WorkerExit { run_id: 1, code: Some(3) };
        assert_eq!(failed.outcome(), (RunStatus::Error, Some("exit code 3".to_string())));

        let killed = WorkerExit { run_id: 1, code: None };
        assert_eq!(killed.outcome().0, RunStatus::Error);
    }

    #[test]
    fn test_worker_command_arguments() {
        let config = ExecutorConfig::default();
        let cmd = worker_command(&config, &request());
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "python3");
        let args: Vec<String> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-m",
                "app.cli",
                "--start-url",
                "https://savee.it/pop",
                "--max-items",
                "50",
                "--run-id",
                "12"
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_program_is_spawn_error() {
        let config = ExecutorConfig {
            worker_program: "/nonexistent/runsched-worker".to_string(),
            worker_args: Vec::new(),
            ..ExecutorConfig::default()
        };
        let err = spawn_worker(&config, &request()).unwrap_err();
        assert!(matches!(err, RunschedError::Spawn(_)));
    }
}
