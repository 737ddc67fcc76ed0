//! Effective interval calculation with error and zero-result backoff.
//!
//! The interval for a source is:
//! - Base: per-source override, else the global minimum, clamped to
//!   `[floor, max]`
//! - Multiplier: `2^errors * (1 + zero_uploads)` over the recent run window,
//!   or 1 when backoff is disabled for the source. A failed run counts as an
//!   error only, never also as a zero-upload run.
//! - Effective: `base * multiplier`, never below base, never above max

use crate::config::SchedulerConfig;
use crate::store::{Run, RunStatus, Source};

/// Exponent cap so `2^errors` cannot overflow.
const MAX_ERROR_EXPONENT: u32 = 32;

/// Inputs of the interval calculation that do not come from a source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    pub min_secs: u64,
    pub max_secs: u64,
    pub floor_secs: u64,
}

impl From<&SchedulerConfig> for IntervalBounds {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            min_secs: config.min_interval_secs,
            max_secs: config.max_interval_secs,
            floor_secs: config.interval_floor_secs,
        }
    }
}

/// Effective interval with the numbers that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBreakdown {
    pub base_secs: u64,
    pub error_count: u32,
    pub zero_upload_count: u32,
    pub multiplier: u64,
    pub effective_secs: u64,
}

/// Compute the effective interval.
///
/// `history` is the recent run window in any order; only status and uploaded
/// counts are read.
pub fn effective_interval(
    override_secs: Option<u64>,
    disable_backoff: bool,
    history: &[Run],
    bounds: IntervalBounds,
) -> IntervalBreakdown {
    let ceiling = bounds.max_secs.max(bounds.floor_secs);
    let base_secs = override_secs.unwrap_or(bounds.min_secs).clamp(bounds.floor_secs, ceiling);

    let error_count = history.iter().filter(|r| r.status == RunStatus::Error).count() as u32;
    let zero_upload_count = history
        .iter()
        .filter(|r| r.status != RunStatus::Error && r.counters.uploaded == 0)
        .count() as u32;

    let multiplier = if disable_backoff {
        1
    } else {
        2u64.saturating_pow(error_count.min(MAX_ERROR_EXPONENT))
            .saturating_mul(1 + zero_upload_count as u64)
    };

    let effective_secs = base_secs.saturating_mul(multiplier).max(base_secs).min(ceiling);

    IntervalBreakdown {
        base_secs,
        error_count,
        zero_upload_count,
        multiplier,
        effective_secs,
    }
}

/// Effective interval of a source given its recent runs.
pub fn source_interval(source: &Source, history: &[Run], bounds: IntervalBounds) -> IntervalBreakdown {
    effective_interval(source.interval_seconds, source.disable_backoff, history, bounds)
}
