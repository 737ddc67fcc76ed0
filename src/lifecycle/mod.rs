//! Run lifecycle: exit recording, reconciliation and operator controls.

mod control;
mod reconciler;

pub use control::{AddSource, Controller, EditSource, RunNow, SourceDetail, SourceView, StopReport};
pub use reconciler::{ReconcileReport, RunState, RunView, is_stale, reconcile, record_exit, run_state};
