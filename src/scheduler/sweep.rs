//! Sweep driver.
//!
//! One sweep loads a batch of active sources (most recently updated first),
//! runs admission for each in order while counting the parallel-start
//! budget, then dispatches the admitted sources concurrently, each on its own
//! store session. A failure for one source is reported and never aborts the
//! sweep. Safety against concurrent sweeps comes from the dispatch lock.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::scheduler::admission::{Admission, AdmissionRequest, SkipReason, admit};
use crate::scheduler::dispatch::{DispatchOutcome, DispatchRequest, StartedRun, dispatch};
use crate::scheduler::interval::IntervalBounds;
use crate::store::{RunKind, Source};

/// Options for one sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOptions {
    /// Bypass the interval check and start `backfill` runs
    pub backfill: bool,
    /// Bypass the interval and capacity checks
    pub force: bool,
    /// Clock override, mainly for tests
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub source_id: i64,
    pub reason: String,
    pub detail: String,
}

impl SkippedSource {
    fn new(source_id: i64, reason: &SkipReason) -> Self {
        Self {
            source_id,
            reason: reason.code(),
            detail: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub source_id: i64,
    pub error: String,
}

/// Structured result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started: Vec<StartedRun>,
    pub skipped: Vec<SkippedSource>,
    pub failed: Vec<FailedSource>,
}

impl SweepReport {
    /// Skip reason code for a source, if it was skipped.
    pub fn skip_reason(&self, source_id: i64) -> Option<&str> {
        self.skipped
            .iter()
            .find(|s| s.source_id == source_id)
            .map(|s| s.reason.as_str())
    }
}

impl Scheduler {
    /// Run one sweep over active sources.
    pub async fn sweep(&self, options: SweepOptions) -> Result<SweepReport> {
        let now = options.now.unwrap_or_else(Utc::now);
        let mut report = SweepReport::default();

        let this = self.clone();
        let (admitted, skipped, failed) = tokio::task::spawn_blocking(move || this.admit_batch(&options, now)).await??;
        report.skipped = skipped;
        report.failed = failed;

        let kind = if options.backfill {
            RunKind::Backfill
        } else {
            RunKind::Scheduled
        };

        let dispatches = admitted.into_iter().map(|source| {
            let this = self.clone();
            async move {
                let source_id = source.id;
                let result = tokio::task::spawn_blocking(move || -> Result<DispatchOutcome> {
                    let store = this.db.session()?;
                    let request = DispatchRequest {
                        kind,
                        max_items: None,
                        history_window: this.config.scheduler.history_window,
                        bypass_interval: options.backfill || options.force,
                        bounds: IntervalBounds::from(&this.config.scheduler),
                        now,
                    };
                    dispatch(&store, this.executor.as_ref(), &source, &request)
                })
                .await;
                (source_id, result)
            }
        });

        for (source_id, result) in join_all(dispatches).await {
            match result {
                Ok(Ok(DispatchOutcome::Started(started))) => report.started.push(started),
                Ok(Ok(DispatchOutcome::Skipped(reason))) => report.skipped.push(SkippedSource::new(source_id, &reason)),
                Ok(Err(e)) => report.failed.push(FailedSource {
                    source_id,
                    error: e.to_string(),
                }),
                Err(e) => report.failed.push(FailedSource {
                    source_id,
                    error: format!("dispatch task failed: {}", e),
                }),
            }
        }

        log::info!(
            "Sweep done: {} started, {} skipped, {} failed",
            report.started.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Admission pass; blocking.
    fn admit_batch(
        &self,
        options: &SweepOptions,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Source>, Vec<SkippedSource>, Vec<FailedSource>)> {
        let store = self.db.session()?;
        let scheduler = &self.config.scheduler;
        let sources = store.list_active_sources(&scheduler.excluded_categories, scheduler.batch_size)?;
        log::debug!("Sweep considering {} source(s)", sources.len());

        let mut admitted = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        // Capacity is read at most once per sweep
        let mut capacity_verdict: Option<Option<String>> = None;

        for source in sources {
            let request = AdmissionRequest {
                now,
                backfill: options.backfill,
                force: options.force,
                budget_exhausted: admitted.len() >= scheduler.parallel_start_budget,
            };
            let capacity = || -> Result<Option<String>> {
                if let Some(verdict) = &capacity_verdict {
                    return Ok(verdict.clone());
                }
                let verdict = self.capacity.usage(&store)?.check(&self.config.capacity);
                capacity_verdict = Some(verdict.clone());
                Ok(verdict)
            };

            match admit(&store, source.id, &request, scheduler, capacity) {
                Ok(Admission::Eligible { interval }) => {
                    log::debug!(
                        "Source {} admitted (interval {}s, x{})",
                        source.id,
                        interval.effective_secs,
                        interval.multiplier
                    );
                    admitted.push(source);
                }
                Ok(Admission::Rejected(reason)) => skipped.push(SkippedSource::new(source.id, &reason)),
                Err(e) => {
                    log::warn!("Admission failed for source {}: {}", source.id, e);
                    failed.push(FailedSource {
                        source_id: source.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok((admitted, skipped, failed))
    }

    /// Sweep on a fixed interval until `shutdown` resolves, then drain the executor.
    pub async fn run_daemon<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let every = Duration::from_secs(self.config.scheduler.sweep_interval_secs.max(1));
        log::info!(
            "Daemon started: sweeping every {}s in {} mode",
            every.as_secs(),
            self.executor.mode().as_str()
        );

        loop {
            if let Err(e) = self.sweep(SweepOptions::default()).await {
                log::error!("Sweep failed: {}", e);
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(every) => {}
            }
        }

        log::info!("Daemon stopping, waiting for workers");
        self.executor.drain().await;
        Ok(())
    }
}
