//! runsched - run scheduler and lifecycle controller for periodic scrape jobs
//!
//! Decides when each configured source may start a run, guarantees at most
//! one live run per source across concurrent schedulers, hands runs to a
//! worker executor and closes them out from exit events, operator actions or
//! reconciliation against output records.

pub mod capacity;
pub mod config;
pub mod error;
pub mod executor;
pub mod id;
pub mod lifecycle;
pub mod locator;
pub mod scheduler;
pub mod server;
pub mod store;

pub use error::{Result, RunschedError};
