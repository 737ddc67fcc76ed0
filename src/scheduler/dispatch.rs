//! Dispatch coordination.
//!
//! Starting a run for a source:
//! 1. Try the per-source advisory lock; contention is a `locked` skip
//! 2. Re-check status, overlap and interval under the lock, since another
//!    caller may have started and finished a run after this caller's admission
//! 3. Resolve the item ceiling (request, else carried from the latest run, else 0)
//! 4. Create or recycle the run row, `running` for inline and `pending` for external execution
//! 5. Hand the run to the executor
//!
//! The lock guard is dropped on every path out of [`dispatch`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, RunschedError};
use crate::executor::{ExecutionMode, ExecutionStarted, Executor, StartRequest};
use crate::scheduler::admission::{SkipReason, check_due};
use crate::scheduler::interval::IntervalBounds;
use crate::store::{DISPATCH_LOCK_NAMESPACE, NewRun, RunKind, RunStatus, RunStore, Source};

/// What to start.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest {
    pub kind: RunKind,
    /// Explicit ceiling; None carries forward the latest run's ceiling
    pub max_items: Option<u64>,
    pub history_window: usize,
    /// Backfill or force: the interval re-check is skipped
    pub bypass_interval: bool,
    pub bounds: IntervalBounds,
    pub now: DateTime<Utc>,
}

/// A run that dispatch created or recycled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedRun {
    pub run_id: i64,
    pub source_id: i64,
    pub url: String,
    pub max_items: u64,
    pub status: RunStatus,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started(StartedRun),
    Skipped(SkipReason),
}

/// Start a run for `source`.
///
/// Executor failures mark the new run `error` before the error is returned.
pub fn dispatch(
    store: &RunStore,
    executor: &dyn Executor,
    source: &Source,
    request: &DispatchRequest,
) -> Result<DispatchOutcome> {
    let Some(lock) = store.try_advisory_lock(DISPATCH_LOCK_NAMESPACE, source.id)? else {
        log::info!("Source {} is locked by another dispatcher", source.id);
        return Ok(DispatchOutcome::Skipped(SkipReason::Locked));
    };

    let outcome = dispatch_locked(store, executor, source, request);

    if let Err(e) = lock.release() {
        log::warn!("Failed to release dispatch lock of source {}: {}", source.id, e);
    }
    outcome
}

fn dispatch_locked(
    store: &RunStore,
    executor: &dyn Executor,
    source: &Source,
    request: &DispatchRequest,
) -> Result<DispatchOutcome> {
    let snapshot = store.admission_snapshot(source.id, request.history_window)?;
    if let Err(reason) = check_due(&snapshot, request.now, request.bypass_interval, request.bounds) {
        log::info!("Source {} no longer due under the lock: {}", source.id, reason);
        return Ok(DispatchOutcome::Skipped(reason));
    }
    let source = &snapshot.source;

    let max_items = match request.max_items {
        Some(max_items) => max_items,
        None => store.latest_run(source.id)?.map(|r| r.max_items).unwrap_or(0),
    };

    let mode = executor.mode();
    let status = match mode {
        ExecutionMode::Inline => RunStatus::Running,
        ExecutionMode::External => RunStatus::Pending,
    };

    let row = store.start_run(
        &NewRun {
            source_id: source.id,
            kind: request.kind,
            max_items,
            status,
            history_window: request.history_window,
        },
        request.now,
    )?;
    let run_id = row.run.id;
    tracing::info!(
        run_id,
        source_id = source.id,
        kind = %request.kind,
        mode = mode.as_str(),
        max_items,
        reused = row.reused,
        "Created run"
    );

    let start = StartRequest {
        run_id,
        source_id: source.id,
        url: source.url.clone(),
        max_items,
    };

    match executor.start(&start) {
        Ok(ExecutionStarted::Spawned { .. }) => {
            if let Err(e) = store.mark_started(run_id, Utc::now()) {
                log::error!("Failed to persist start of run {}: {}", run_id, e);
                executor.terminate(run_id);
                mark_failed(store, run_id, &e);
                return Err(e);
            }
        }
        Ok(ExecutionStarted::Queued) => {}
        Err(e) => {
            log::error!("Failed to start run {} for source {}: {}", run_id, source.id, e);
            mark_failed(store, run_id, &e);
            return Err(e);
        }
    }

    Ok(DispatchOutcome::Started(StartedRun {
        run_id,
        source_id: source.id,
        url: source.url.clone(),
        max_items,
        status,
        reused: row.reused,
    }))
}

fn mark_failed(store: &RunStore, run_id: i64, error: &RunschedError) {
    let message = error.to_string();
    if let Err(e) = store.finish_run(run_id, RunStatus::Error, Some(&message), None, Utc::now()) {
        log::error!("Failed to mark run {} as error: {}", run_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerConfig, StoreConfig};
    use crate::locator::TargetLocator;
    use crate::store::{Database, SourceStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Executor double that records start requests.
    struct FakeExecutor {
        mode: ExecutionMode,
        fail: bool,
        started: Mutex<Vec<StartRequest>>,
    }

    impl FakeExecutor {
        fn new(mode: ExecutionMode) -> Self {
            Self {
                mode,
                fail: false,
                started: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn mode(&self) -> ExecutionMode {
            self.mode
        }

        fn start(&self, request: &StartRequest) -> Result<ExecutionStarted> {
            if self.fail {
                return Err(RunschedError::Spawn("No such file or directory".to_string()));
            }
            self.started.lock().unwrap().push(request.clone());
            Ok(match self.mode {
                ExecutionMode::Inline => ExecutionStarted::Spawned { pid: Some(1) },
                ExecutionMode::External => ExecutionStarted::Queued,
            })
        }

        fn terminate(&self, _run_id: i64) -> bool {
            false
        }

        async fn drain(&self) {}
    }

    fn setup() -> (Database, Source, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Database::open(&StoreConfig {
            path: temp.path().join("runsched.db"),
            ..StoreConfig::default()
        })
        .unwrap();
        let source = db
            .session()
            .unwrap()
            .create_source(&TargetLocator::parse("https://savee.it/pop").unwrap(), None, false)
            .unwrap();
        (db, source, temp)
    }

    fn request(max_items: Option<u64>) -> DispatchRequest {
        DispatchRequest {
            kind: RunKind::Manual,
            max_items,
            history_window: 3,
            bypass_interval: true,
            bounds: IntervalBounds::from(&SchedulerConfig::default()),
            now: Utc::now(),
        }
    }

    #[test]
    fn test_inline_dispatch_starts_running_run() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::Inline);

        let outcome = dispatch(&store, &executor, &source, &request(Some(25))).unwrap();
        let DispatchOutcome::Started(started) = outcome else {
            panic!("expected started");
        };
        assert_eq!(started.status, RunStatus::Running);
        assert_eq!(started.max_items, 25);

        let run = store.require_run(started.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        let seen = executor.started.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url, "https://savee.it/pop");
        assert_eq!(seen[0].max_items, 25);
    }

    #[test]
    fn test_external_dispatch_leaves_run_pending() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::External);

        let outcome = dispatch(&store, &executor, &source, &request(None)).unwrap();
        let DispatchOutcome::Started(started) = outcome else {
            panic!("expected started");
        };
        assert_eq!(started.status, RunStatus::Pending);
        assert_eq!(store.list_pending_runs(10).unwrap().len(), 1);
    }

    #[test]
    fn test_second_dispatch_sees_active_run() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::Inline);

        let DispatchOutcome::Started(first) = dispatch(&store, &executor, &source, &request(None)).unwrap() else {
            panic!("expected started");
        };
        let second = dispatch(&store, &executor, &source, &request(None)).unwrap();
        assert_eq!(
            second,
            DispatchOutcome::Skipped(SkipReason::AlreadyRunning { run_id: first.run_id })
        );
    }

    #[test]
    fn test_held_lock_skips_as_locked() {
        let (db, source, _temp) = setup();
        let holder = db.session().unwrap();
        let _lock = holder
            .try_advisory_lock(DISPATCH_LOCK_NAMESPACE, source.id)
            .unwrap()
            .unwrap();

        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::Inline);
        let outcome = dispatch(&store, &executor, &source, &request(None)).unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Locked));
        assert!(executor.started.lock().unwrap().is_empty());
    }

    #[test]
    fn test_lock_released_after_dispatch() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::Inline);
        dispatch(&store, &executor, &source, &request(None)).unwrap();

        let other = db.session().unwrap();
        assert!(
            other
                .try_advisory_lock(DISPATCH_LOCK_NAMESPACE, source.id)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_ceiling_carries_forward() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::Inline);

        let DispatchOutcome::Started(first) = dispatch(&store, &executor, &source, &request(Some(40))).unwrap() else {
            panic!("expected started");
        };
        store
            .finish_run(first.run_id, RunStatus::Completed, None, Some(0), Utc::now())
            .unwrap();

        let DispatchOutcome::Started(second) = dispatch(&store, &executor, &source, &request(None)).unwrap() else {
            panic!("expected started");
        };
        assert_eq!(second.max_items, 40);
    }

    #[test]
    fn test_first_run_defaults_to_unbounded() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::External);

        let DispatchOutcome::Started(started) = dispatch(&store, &executor, &source, &request(None)).unwrap() else {
            panic!("expected started");
        };
        assert_eq!(started.max_items, 0);
    }

    #[test]
    fn test_spawn_failure_marks_run_error_and_releases_lock() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let mut executor = FakeExecutor::new(ExecutionMode::Inline);
        executor.fail = true;

        let err = dispatch(&store, &executor, &source, &request(None)).unwrap_err();
        assert!(matches!(err, RunschedError::Spawn(_)));

        let run = store.latest_run(source.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error_message.unwrap().contains("No such file"));
        assert!(run.completed_at.is_some());

        let other = db.session().unwrap();
        assert!(
            other
                .try_advisory_lock(DISPATCH_LOCK_NAMESPACE, source.id)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_stale_admission_is_too_soon_under_lock() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        let executor = FakeExecutor::new(ExecutionMode::External);

        let DispatchOutcome::Started(first) = dispatch(&store, &executor, &source, &request(None)).unwrap() else {
            panic!("expected started");
        };
        let finished = Utc::now();
        store
            .finish_run(first.run_id, RunStatus::Completed, None, Some(0), finished)
            .unwrap();

        // A caller admitted before that run finished must not start another one
        let scheduled = DispatchRequest {
            kind: RunKind::Scheduled,
            bypass_interval: false,
            now: finished,
            ..request(None)
        };
        let outcome = dispatch(&store, &executor, &source, &scheduled).unwrap();
        assert!(
            matches!(outcome, DispatchOutcome::Skipped(SkipReason::TooSoon { .. })),
            "{:?}",
            outcome
        );
        assert_eq!(executor.started.lock().unwrap().len(), 1);
        assert_eq!(store.list_runs(source.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_stopped_source_is_skipped_under_lock() {
        let (db, source, _temp) = setup();
        let store = db.session().unwrap();
        store.set_source_status(source.id, SourceStatus::Stopped).unwrap();
        let executor = FakeExecutor::new(ExecutionMode::External);

        let outcome = dispatch(&store, &executor, &source, &request(None)).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped(SkipReason::SourceInactive {
                status: SourceStatus::Stopped
            })
        );
        assert!(executor.started.lock().unwrap().is_empty());
    }
}
