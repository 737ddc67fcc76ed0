//! Storage layer for runsched.
//!
//! One SQLite database holds sources, runs, job logs, output records and the
//! advisory lock table. Callers open a [`RunStore`] session per unit of work
//! from a shared [`Database`].
//!
//! # Example
//!
//! ```ignore
//! use runsched::store::{Database, NewRun, RunKind, RunStatus};
//!
//! let db = Database::open(&config.store)?;
//! let store = db.session()?;
//! let (source, _) = store.create_or_get_source(&locator)?;
//! let row = store.start_run(&NewRun { source_id: source.id, kind: RunKind::Manual,
//!     max_items: 0, status: RunStatus::Pending, history_window: 3 }, Utc::now())?;
//! ```

mod lock;
mod records;
mod run_store;

pub use lock::{AdvisoryLock, DISPATCH_LOCK_NAMESPACE};
pub use records::{
    Counters, JobLogEntry, JobOutcome, JobStage, NewJobLog, NewOutput, OutputRecord, PendingRun, Run, RunKind,
    RunStatus, Source, SourceCategory, SourceStatus,
};
pub use run_store::{AdmissionSnapshot, Database, NewRun, RunStore, StartedRow, StorageUsage};
