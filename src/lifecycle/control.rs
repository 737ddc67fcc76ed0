//! Operator controls.
//!
//! Every method is synchronous and opens its own store session; async
//! callers run them on the blocking pool. Actions are idempotent: pausing a
//! paused source or stopping a stopped one returns the current state.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunschedError};
use crate::executor::WorkerExit;
use crate::lifecycle::reconciler::{ReconcileReport, RunView, reconcile, record_exit};
use crate::locator::TargetLocator;
use crate::scheduler::{
    Admission, AdmissionRequest, DispatchOutcome, DispatchRequest, IntervalBounds, Scheduler, admit, dispatch,
};
use crate::store::{
    Counters, JobLogEntry, NewJobLog, NewOutput, OutputRecord, PendingRun, RunKind, RunStatus, RunStore, Source,
    SourceStatus,
};

/// Runs returned by default in a source detail view.
const DEFAULT_RUN_LIMIT: usize = 20;

/// A source with its latest run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: Source,
    pub latest_run: Option<RunView>,
}

/// A source with its recent runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceDetail {
    #[serde(flatten)]
    pub view: SourceView,
    pub runs: Vec<RunView>,
}

/// New source request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddSource {
    pub url: String,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub disable_backoff: bool,
}

/// Partial source update. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditSource {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_items: Option<u64>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// Drop the per-source interval override
    #[serde(default)]
    pub clear_interval: bool,
    #[serde(default)]
    pub disable_backoff: Option<bool>,
}

impl EditSource {
    fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.max_items.is_none()
            && self.interval_seconds.is_none()
            && !self.clear_interval
            && self.disable_backoff.is_none()
    }
}

/// Run-now request.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RunNow {
    /// Bypass the interval and capacity checks
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub max_items: Option<u64>,
}

/// Result of a stop.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StopReport {
    pub source: Source,
    pub stopped_run: Option<i64>,
    /// A local worker was asked to terminate
    pub signalled: bool,
}

/// Operator control surface over the scheduler.
#[derive(Clone)]
pub struct Controller {
    scheduler: Scheduler,
}

impl Controller {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn session(&self) -> Result<RunStore> {
        self.scheduler.db.session()
    }

    fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.scheduler.config.scheduler.stale_threshold_secs)
    }

    fn view(&self, store: &RunStore, source: Source) -> Result<SourceView> {
        let latest_run = store
            .latest_run(source.id)?
            .map(|run| RunView::new(run, self.stale_threshold(), Utc::now()));
        Ok(SourceView { source, latest_run })
    }

    /// Validate a locator and create its source; an existing url returns the existing source.
    pub fn add_source(&self, request: &AddSource) -> Result<(SourceView, bool)> {
        let locator = TargetLocator::parse(&request.url)?;
        let store = self.session()?;
        let (source, created) = match store.find_source_by_url(&locator.url)? {
            Some(existing) => (existing, false),
            None => match store.create_source(&locator, request.interval_seconds, request.disable_backoff) {
                Ok(source) => (source, true),
                Err(RunschedError::InvalidInput(_)) => (store.create_or_get_source(&locator)?.0, false),
                Err(e) => return Err(e),
            },
        };
        if created {
            log::info!("Added source {} ({}) {}", source.id, source.category, source.url);
        }
        Ok((self.view(&store, source)?, created))
    }

    /// All sources with their latest run, most recently updated first.
    pub fn list_sources(&self) -> Result<Vec<SourceView>> {
        let store = self.session()?;
        store
            .list_sources()?
            .into_iter()
            .map(|source| self.view(&store, source))
            .collect()
    }

    pub fn show_source(&self, id: i64) -> Result<SourceDetail> {
        let store = self.session()?;
        let source = store.require_source(id)?;
        let runs = self.runs_in(&store, id, DEFAULT_RUN_LIMIT)?;
        Ok(SourceDetail {
            view: self.view(&store, source)?,
            runs,
        })
    }

    /// Runs of a source, newest first.
    pub fn list_runs(&self, source_id: i64, limit: usize) -> Result<Vec<RunView>> {
        let store = self.session()?;
        store.require_source(source_id)?;
        self.runs_in(&store, source_id, limit)
    }

    fn runs_in(&self, store: &RunStore, source_id: i64, limit: usize) -> Result<Vec<RunView>> {
        let now = Utc::now();
        Ok(store
            .list_runs(source_id, limit)?
            .into_iter()
            .map(|run| RunView::new(run, self.stale_threshold(), now))
            .collect())
    }

    /// Pause a source. Its current run, if any, is left alone.
    pub fn pause(&self, id: i64) -> Result<SourceView> {
        let store = self.session()?;
        let source = store.set_source_status(id, SourceStatus::Paused)?;
        log::info!("Paused source {}", id);
        self.view(&store, source)
    }

    pub fn resume(&self, id: i64) -> Result<SourceView> {
        let store = self.session()?;
        let source = store.set_source_status(id, SourceStatus::Active)?;
        log::info!("Resumed source {}", id);
        self.view(&store, source)
    }

    /// Start a manual run now.
    ///
    /// `force` skips the interval and capacity checks but never the overlap
    /// check or an inactive source.
    pub fn run_now(&self, id: i64, request: &RunNow) -> Result<DispatchOutcome> {
        let store = self.session()?;
        let config = &self.scheduler.config;
        let admission_request = AdmissionRequest {
            force: request.force,
            ..AdmissionRequest::at(Utc::now())
        };
        let capacity = || -> Result<Option<String>> {
            Ok(self.scheduler.capacity.usage(&store)?.check(&config.capacity))
        };

        match admit(&store, id, &admission_request, &config.scheduler, capacity)? {
            Admission::Rejected(reason) => Ok(DispatchOutcome::Skipped(reason)),
            Admission::Eligible { .. } => {
                let source = store.require_source(id)?;
                let dispatch_request = DispatchRequest {
                    kind: RunKind::Manual,
                    max_items: request.max_items,
                    history_window: config.scheduler.history_window,
                    bypass_interval: request.force,
                    bounds: IntervalBounds::from(&config.scheduler),
                    now: Utc::now(),
                };
                dispatch(&store, self.scheduler.executor.as_ref(), &source, &dispatch_request)
            }
        }
    }

    /// Stop a source and close its active run.
    pub fn stop(&self, id: i64) -> Result<StopReport> {
        let store = self.session()?;
        let source = store.set_source_status(id, SourceStatus::Stopped)?;

        let mut stopped_run = None;
        let mut signalled = false;
        if let Some(run) = store.active_run(id)? {
            if store.finish_run(run.id, RunStatus::Stopped, Some("stopped by operator"), None, Utc::now())? {
                stopped_run = Some(run.id);
            }
            signalled = self.scheduler.executor.terminate(run.id);
        }
        log::info!(
            "Stopped source {} (run: {:?}, worker signalled: {})",
            id,
            stopped_run,
            signalled
        );

        Ok(StopReport {
            source,
            stopped_run,
            signalled,
        })
    }

    /// Edit url, ceiling and schedule of a source. Never starts or restarts a run.
    pub fn edit(&self, id: i64, edit: &EditSource) -> Result<SourceView> {
        if edit.is_empty() {
            return Err(RunschedError::InvalidInput("nothing to edit".to_string()));
        }
        if edit.clear_interval && edit.interval_seconds.is_some() {
            return Err(RunschedError::InvalidInput(
                "interval_seconds and clear_interval are mutually exclusive".to_string(),
            ));
        }
        let locator = edit.url.as_deref().map(TargetLocator::parse).transpose()?;

        let store = self.session()?;
        let mut source = store.require_source(id)?;

        if let Some(locator) = &locator
            && locator.url != source.url
        {
            source = store.update_source_locator(id, locator)?;
        }

        if edit.interval_seconds.is_some() || edit.clear_interval || edit.disable_backoff.is_some() {
            let interval_seconds = if edit.clear_interval {
                None
            } else {
                edit.interval_seconds.or(source.interval_seconds)
            };
            let disable_backoff = edit.disable_backoff.unwrap_or(source.disable_backoff);
            source = store.update_source_schedule(id, interval_seconds, disable_backoff)?;
        }

        if let Some(max_items) = edit.max_items {
            // The active run if there is one, otherwise the run future dispatches carry forward
            let target = match store.active_run(id)? {
                Some(run) => Some(run),
                None => store.latest_run(id)?,
            };
            let Some(run) = target else {
                return Err(RunschedError::InvalidState(format!(
                    "source {} has no runs to carry max_items; pass max_items to run-now instead",
                    id
                )));
            };
            store.set_run_max_items(run.id, max_items)?;
        }

        log::info!("Edited source {}", id);
        self.view(&store, source)
    }

    /// Delete a source with its runs and job logs, and optionally its output records.
    pub fn delete(&self, id: i64, delete_outputs: bool) -> Result<()> {
        let store = self.session()?;
        if let Some(run) = store.active_run(id)? {
            self.scheduler.executor.terminate(run.id);
        }
        store.delete_source(id, delete_outputs)?;
        log::info!("Deleted source {} (outputs deleted: {})", id, delete_outputs);
        Ok(())
    }

    /// Pause a running run.
    pub fn pause_run(&self, run_id: i64) -> Result<RunView> {
        self.transition_run(run_id, RunStatus::Running, RunStatus::Paused)
    }

    /// Resume a paused run.
    pub fn resume_run(&self, run_id: i64) -> Result<RunView> {
        self.transition_run(run_id, RunStatus::Paused, RunStatus::Running)
    }

    fn transition_run(&self, run_id: i64, from: RunStatus, to: RunStatus) -> Result<RunView> {
        let store = self.session()?;
        let run = store.require_run(run_id)?;
        if run.status != to && !store.transition_run(run_id, from, to)? {
            return Err(RunschedError::InvalidState(format!(
                "run {} is {}, expected {}",
                run_id, run.status, from
            )));
        }
        Ok(RunView::new(store.require_run(run_id)?, self.stale_threshold(), Utc::now()))
    }

    pub fn reconcile(&self, run_id: i64, force: bool) -> Result<ReconcileReport> {
        let store = self.session()?;
        reconcile(&store, run_id, force, self.stale_threshold(), Utc::now())
    }

    /// Newest job log entries of a run.
    pub fn job_logs(&self, run_id: i64, limit: usize) -> Result<Vec<JobLogEntry>> {
        let store = self.session()?;
        store.require_run(run_id)?;
        store.list_job_logs(run_id, limit)
    }

    pub fn pending_runs(&self, limit: usize) -> Result<Vec<PendingRun>> {
        self.session()?.list_pending_runs(limit)
    }

    /// Claim a pending run for an external worker. False if it is no longer pending.
    pub fn claim_run(&self, run_id: i64) -> Result<bool> {
        let store = self.session()?;
        store.require_run(run_id)?;
        store.claim_run(run_id, Utc::now())
    }

    /// Exit event reported by an external worker.
    pub fn report_exit(&self, run_id: i64, code: Option<i32>) -> Result<RunView> {
        let store = self.session()?;
        record_exit(&store, &WorkerExit { run_id, code }, Utc::now())?;
        Ok(RunView::new(store.require_run(run_id)?, self.stale_threshold(), Utc::now()))
    }

    /// Worker progress report; counters never go down.
    pub fn report_progress(&self, run_id: i64, counters: &Counters) -> Result<Counters> {
        self.session()?.report_progress(run_id, counters)
    }

    pub fn append_job_log(&self, run_id: i64, entry: &NewJobLog) -> Result<JobLogEntry> {
        self.session()?.append_job_log(run_id, entry)
    }

    pub fn record_output(&self, run_id: i64, output: &NewOutput) -> Result<OutputRecord> {
        if output.external_id.trim().is_empty() {
            return Err(RunschedError::InvalidInput("external_id must not be empty".to_string()));
        }
        self.session()?.record_output(run_id, output)
    }
}
