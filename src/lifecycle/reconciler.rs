//! Run lifecycle reconciliation.
//!
//! Terminal transitions come from two places: a worker's exit event and an
//! explicit reconcile request. The first terminal outcome always wins, so an
//! exit reported after an operator stop is ignored.
//!
//! A running run whose `updated_at` is older than the staleness threshold is
//! shown as `stale`. Stale runs are never closed automatically.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, RunschedError};
use crate::executor::WorkerExit;
use crate::store::{Run, RunStatus, RunStore};

/// Run status as shown to operators.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    /// Running, but silent for longer than the staleness threshold
    Stale,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Stale => "stale",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Error => "error",
            RunState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a run counts as stale at `now`.
pub fn is_stale(run: &Run, threshold: Duration, now: DateTime<Utc>) -> bool {
    if run.status != RunStatus::Running {
        return false;
    }
    let silent_ms = (now - run.updated_at).num_milliseconds();
    silent_ms > threshold.as_millis() as i64
}

/// Operator-facing state of a run.
pub fn run_state(run: &Run, threshold: Duration, now: DateTime<Utc>) -> RunState {
    match run.status {
        RunStatus::Running if is_stale(run, threshold, now) => RunState::Stale,
        RunStatus::Running => RunState::Running,
        RunStatus::Pending => RunState::Pending,
        RunStatus::Paused => RunState::Paused,
        RunStatus::Completed => RunState::Completed,
        RunStatus::Error => RunState::Error,
        RunStatus::Stopped => RunState::Stopped,
    }
}

/// A run together with its operator-facing state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    pub run_status: RunState,
}

impl RunView {
    pub fn new(run: Run, threshold: Duration, now: DateTime<Utc>) -> Self {
        let run_status = run_state(&run, threshold, now);
        Self { run, run_status }
    }
}

/// Record a worker exit. Returns false when the run was already terminal.
pub fn record_exit(store: &RunStore, exit: &WorkerExit, now: DateTime<Utc>) -> Result<bool> {
    let (status, message) = exit.outcome();
    let recorded = store.finish_run(exit.run_id, status, message.as_deref(), exit.code, now)?;
    if recorded {
        tracing::info!(run_id = exit.run_id, status = %status, code = ?exit.code, "Recorded worker exit");
    }
    Ok(recorded)
}

/// Result of a reconcile request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconcileReport {
    pub run: Run,
    pub previous_status: RunStatus,
    /// False when the run was already terminal and nothing changed
    pub changed: bool,
}

/// Close a run from its output records.
///
/// Terminal runs are reported unchanged. Runs that are not stale need
/// `force`.
pub fn reconcile(
    store: &RunStore,
    run_id: i64,
    force: bool,
    stale_threshold: Duration,
    now: DateTime<Utc>,
) -> Result<ReconcileReport> {
    let run = store.require_run(run_id)?;
    let previous_status = run.status;
    if run.status.is_terminal() {
        return Ok(ReconcileReport {
            run,
            previous_status,
            changed: false,
        });
    }

    if !force && !is_stale(&run, stale_threshold, now) {
        return Err(RunschedError::InvalidState(format!(
            "run {} is {} and not stale; reconcile with force to close it",
            run_id, run.status
        )));
    }

    let run = store.reconcile_run(run_id, now)?;
    log::info!(
        "Reconciled run {}: {} -> completed, uploaded={}",
        run_id,
        previous_status,
        run.counters.uploaded
    );
    Ok(ReconcileReport {
        run,
        previous_status,
        changed: true,
    })
}
