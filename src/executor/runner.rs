//! Pending-run runner.
//!
//! The out-of-process side of external execution mode: poll the store for
//! pending runs, claim each one atomically and run its worker, never more
//! than `max_parallel` at a time. Exits are reported like inline workers.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::{ExecutorConfig, RunnerConfig};
use crate::error::{Result, RunschedError};
use crate::executor::worker::{StartRequest, spawn_worker, supervise};
use crate::store::{Database, PendingRun, RunStatus};

pub struct PendingRunner {
    db: Database,
    executor_config: ExecutorConfig,
    config: RunnerConfig,
    permits: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingRunner {
    pub fn new(db: Database, executor_config: ExecutorConfig, config: RunnerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Self {
            db,
            executor_config,
            config,
            permits,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Claim up to the free worker slots of pending runs and start them.
    ///
    /// Returns the number of runs claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let free = self.permits.available_permits();
        if free == 0 {
            log::debug!("All {} worker slots busy", self.config.max_parallel);
            return Ok(0);
        }
        let limit = free.min(self.config.pending_limit.max(1));

        let db = self.db.clone();
        let claimed: Vec<PendingRun> = tokio::task::spawn_blocking(move || -> Result<Vec<PendingRun>> {
            let store = db.session()?;
            let mut claimed = Vec::new();
            for pending in store.list_pending_runs(limit)? {
                if store.claim_run(pending.run_id, Utc::now())? {
                    claimed.push(pending);
                } else {
                    log::debug!("Run {} claimed by another runner", pending.run_id);
                }
            }
            Ok(claimed)
        })
        .await??;

        if claimed.is_empty() {
            log::debug!("No pending runs");
        }

        for pending in &claimed {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|e| RunschedError::InvalidState(format!("runner closed: {}", e)))?;
            let request = StartRequest {
                run_id: pending.run_id,
                source_id: pending.source_id,
                url: pending.url.clone(),
                max_items: pending.max_items,
            };
            log::info!(
                "Running run {} url={} max={}",
                request.run_id,
                request.url,
                request.max_items
            );

            match spawn_worker(&self.executor_config, &request) {
                Ok(child) => {
                    let db = self.db.clone();
                    let handle = tokio::spawn(async move {
                        let exit = supervise(child, request.run_id, db, None).await;
                        if exit.code != Some(0) {
                            log::warn!("Run {} worker failed: {:?}", request.run_id, exit.code);
                        }
                        drop(permit);
                    });
                    if let Ok(mut workers) = self.workers.lock() {
                        workers.retain(|h| !h.is_finished());
                        workers.push(handle);
                    }
                }
                Err(e) => {
                    log::error!("{}", e);
                    self.record_spawn_failure(request.run_id, e.to_string()).await;
                }
            }
        }

        Ok(claimed.len())
    }

    /// Mark a claimed run `error` after its worker failed to start.
    ///
    /// Failures are logged only, so the rest of the batch still runs.
    async fn record_spawn_failure(&self, run_id: i64, message: String) {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<bool> {
            db.session()?
                .finish_run(run_id, RunStatus::Error, Some(&message), None, Utc::now())
        })
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::error!("Failed to record spawn failure of run {}: {}", run_id, e),
            Err(e) => log::error!("Spawn failure task of run {} panicked: {}", run_id, e),
        }
    }

    /// Poll until `shutdown` resolves, then wait for running workers.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));
        log::info!(
            "Runner started: max_parallel={} poll={}s",
            self.config.max_parallel,
            poll.as_secs()
        );

        loop {
            if let Err(e) = self.run_once().await {
                log::error!("Runner poll failed: {}", e);
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        log::info!("Runner stopping");
        self.drain().await;
        Ok(())
    }

    /// Wait for all started workers to exit.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
