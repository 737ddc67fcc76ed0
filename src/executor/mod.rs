//! Worker executors.
//!
//! Dispatch hands a freshly created run to an [`Executor`], chosen once from
//! configuration:
//! - **Inline**: spawn the worker locally and supervise it
//! - **External**: leave the run pending for [`PendingRunner`] or another
//!   out-of-process consumer, optionally notifying a dispatcher webhook

mod external;
mod inline;
mod runner;
mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::store::Database;

pub use external::{DispatchNotifier, ExternalExecutor, WebhookNotifier};
pub use inline::InlineExecutor;
pub use runner::PendingRunner;
pub use worker::{StartRequest, WorkerExit, report_exit, spawn_worker, supervise, worker_command};

/// Where workers run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Inline,
    External,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Inline => "inline",
            ExecutionMode::External => "external",
        }
    }
}

/// How an executor took a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStarted {
    /// Worker process is running under a local supervisor
    Spawned { pid: Option<u32> },
    /// Run stays pending until an external runner claims it
    Queued,
}

/// Strategy for executing a dispatched run.
#[async_trait]
pub trait Executor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Start the run. Must not block on the worker.
    fn start(&self, request: &StartRequest) -> Result<ExecutionStarted>;

    /// Ask a locally supervised worker to stop. False if this executor does not own it.
    fn terminate(&self, run_id: i64) -> bool;

    /// Wait for supervised workers and background notifications to finish.
    async fn drain(&self);
}

/// Build the executor selected by configuration.
pub fn build_executor(config: &ExecutorConfig, db: Database) -> Result<Arc<dyn Executor>> {
    match config.mode {
        ExecutionMode::Inline => Ok(Arc::new(InlineExecutor::new(config.clone(), db)?)),
        ExecutionMode::External => {
            let notifier = WebhookNotifier::from_config(config)?.map(|n| Arc::new(n) as Arc<dyn DispatchNotifier>);
            Ok(Arc::new(ExternalExecutor::new(notifier)))
        }
    }
}
