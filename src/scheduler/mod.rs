//! Scheduling: interval backoff, admission, dispatch and sweeps.
//!
//! This module provides:
//! - **Interval calculation**: effective interval from a source's recent runs
//! - **Admission**: read-only decision whether a source may start now
//! - **Dispatch**: advisory-locked run creation and executor hand-off
//! - **Sweep**: one pass over active sources, plus the daemon loop
//!
//! # Architecture
//!
//! ```text
//! sweep -> admission (one session, sequential, budget counted)
//!       -> dispatch  (one session per admitted source, concurrent)
//!       -> executor  (inline spawn or external queue)
//! ```

mod admission;
mod dispatch;
mod interval;
mod sweep;

use std::sync::Arc;

use crate::capacity::CapacityOracle;
use crate::config::Config;
use crate::executor::Executor;
use crate::store::Database;

pub use admission::{Admission, AdmissionRequest, SkipReason, admit, decide};
pub use dispatch::{DispatchOutcome, DispatchRequest, StartedRun, dispatch};
pub use interval::{IntervalBounds, IntervalBreakdown, effective_interval, source_interval};
pub use sweep::{FailedSource, SkippedSource, SweepOptions, SweepReport};

/// Shared scheduling context: store, config and the injected collaborators.
#[derive(Clone)]
pub struct Scheduler {
    pub db: Database,
    pub config: Arc<Config>,
    pub executor: Arc<dyn Executor>,
    pub capacity: Arc<dyn CapacityOracle>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        config: Arc<Config>,
        executor: Arc<dyn Executor>,
        capacity: Arc<dyn CapacityOracle>,
    ) -> Self {
        Self {
            db,
            config,
            executor,
            capacity,
        }
    }
}
