//! Inline executor: spawns the worker as a child of this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;
use crate::error::{Result, RunschedError};
use crate::executor::worker::{StartRequest, spawn_worker, supervise};
use crate::executor::{ExecutionMode, ExecutionStarted, Executor};
use crate::store::Database;

/// Handle to a supervised worker process.
struct RunningWorker {
    kill: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Executor that runs workers locally and supervises them.
pub struct InlineExecutor {
    config: ExecutorConfig,
    db: Database,
    runtime: Handle,
    workers: Arc<Mutex<HashMap<i64, RunningWorker>>>,
}

impl InlineExecutor {
    /// Create an inline executor bound to the current Tokio runtime.
    pub fn new(config: ExecutorConfig, db: Database) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RunschedError::Spawn(format!("inline executor needs a Tokio runtime: {}", e)))?;
        Ok(Self {
            config,
            db,
            runtime,
            workers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of workers still supervised.
    pub fn running_count(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    fn start(&self, request: &StartRequest) -> Result<ExecutionStarted> {
        let _guard = self.runtime.enter();
        let child = spawn_worker(&self.config, request)?;
        let pid = child.id();
        tracing::info!(run_id = request.run_id, source_id = request.source_id, pid = ?pid, "Spawned worker");

        let (kill_tx, kill_rx) = oneshot::channel();
        let run_id = request.run_id;
        let db = self.db.clone();
        let workers = Arc::clone(&self.workers);

        // Hold the registry lock across spawn so the task cannot deregister
        // before it is registered.
        let mut registry = self
            .workers
            .lock()
            .map_err(|_| RunschedError::InvalidState("worker registry poisoned".to_string()))?;
        let handle = self.runtime.spawn(async move {
            supervise(child, run_id, db, Some(kill_rx)).await;
            if let Ok(mut workers) = workers.lock() {
                workers.remove(&run_id);
            }
        });
        registry.insert(
            run_id,
            RunningWorker {
                kill: Some(kill_tx),
                handle,
            },
        );

        Ok(ExecutionStarted::Spawned { pid })
    }

    fn terminate(&self, run_id: i64) -> bool {
        let Ok(mut workers) = self.workers.lock() else {
            return false;
        };
        match workers.get_mut(&run_id).and_then(|w| w.kill.take()) {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }

    async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain().map(|(_, w)| w.handle).collect(),
            Err(_) => Vec::new(),
        };
        if !handles.is_empty() {
            log::info!("Waiting for {} worker(s) to exit", handles.len());
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}
