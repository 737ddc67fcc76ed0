//! Admission decisions.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. Source must be active
//! 2. No non-terminal run for the source
//! 3. Effective interval elapsed since the last finished run (unless backfill or force)
//! 4. Sweep parallel-start budget left
//! 5. Capacity below soft limits (unless force)
//!
//! Admission is read-only. Lock contention found later at dispatch is also
//! reported as a [`SkipReason`].

use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::interval::{IntervalBounds, IntervalBreakdown, source_interval};
use crate::store::{AdmissionSnapshot, RunStore, SourceStatus};

/// Why a source was not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Operator state is not active
    SourceInactive { status: SourceStatus },
    /// A pending, running or paused run exists
    AlreadyRunning { run_id: i64 },
    /// Effective interval not yet elapsed
    TooSoon { remaining_secs: u64 },
    /// This sweep already started its budget of sources
    ParallelBudget,
    OverCapacity { detail: String },
    /// Another caller holds the dispatch lock
    Locked,
}

impl SkipReason {
    /// Stable reason code for reports and HTTP payloads.
    pub fn code(&self) -> String {
        match self {
            SkipReason::SourceInactive { status } => format!("source_{}", status),
            SkipReason::AlreadyRunning { .. } => "already_running".to_string(),
            SkipReason::TooSoon { .. } => "too_soon".to_string(),
            SkipReason::ParallelBudget => "parallel_budget".to_string(),
            SkipReason::OverCapacity { .. } => "over_capacity".to_string(),
            SkipReason::Locked => "locked".to_string(),
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SourceInactive { status } => write!(f, "source is {}", status),
            SkipReason::AlreadyRunning { run_id } => write!(f, "run {} is still active", run_id),
            SkipReason::TooSoon { remaining_secs } => write!(f, "next run due in {}s", remaining_secs),
            SkipReason::ParallelBudget => write!(f, "parallel start budget exhausted"),
            SkipReason::OverCapacity { detail } => write!(f, "over capacity: {}", detail),
            SkipReason::Locked => write!(f, "dispatch lock held by another caller"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Eligible { interval: IntervalBreakdown },
    Rejected(SkipReason),
}

impl Admission {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Admission::Eligible { .. })
    }
}

/// Caller-side inputs of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest {
    pub now: DateTime<Utc>,
    /// Skip the interval check
    pub backfill: bool,
    /// Skip the interval and capacity checks
    pub force: bool,
    pub budget_exhausted: bool,
}

impl AdmissionRequest {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            backfill: false,
            force: false,
            budget_exhausted: false,
        }
    }
}

/// Decide admission from a snapshot.
///
/// `capacity` is only invoked when every earlier check passed and force is
/// off; it returns the exceeded limit, if any.
pub fn decide<F>(
    snapshot: &AdmissionSnapshot,
    request: &AdmissionRequest,
    config: &SchedulerConfig,
    capacity: F,
) -> Result<Admission>
where
    F: FnOnce() -> Result<Option<String>>,
{
    let interval = match check_due(
        snapshot,
        request.now,
        request.backfill || request.force,
        IntervalBounds::from(config),
    ) {
        Ok(interval) => interval,
        Err(reason) => return Ok(Admission::Rejected(reason)),
    };

    if request.budget_exhausted {
        return Ok(Admission::Rejected(SkipReason::ParallelBudget));
    }

    if !request.force
        && let Some(detail) = capacity()?
    {
        return Ok(Admission::Rejected(SkipReason::OverCapacity { detail }));
    }

    Ok(Admission::Eligible { interval })
}

/// Status, overlap and interval checks.
///
/// Shared by admission and the re-check dispatch makes under the lock.
pub(crate) fn check_due(
    snapshot: &AdmissionSnapshot,
    now: DateTime<Utc>,
    bypass_interval: bool,
    bounds: IntervalBounds,
) -> std::result::Result<IntervalBreakdown, SkipReason> {
    let source = &snapshot.source;
    if source.status != SourceStatus::Active {
        return Err(SkipReason::SourceInactive { status: source.status });
    }

    if let Some(run) = &snapshot.active_run {
        return Err(SkipReason::AlreadyRunning { run_id: run.id });
    }

    let interval = source_interval(source, &snapshot.history, bounds);
    if !bypass_interval && let Some(finished) = snapshot.last_finished_at {
        let elapsed_ms = (now - finished).num_milliseconds().max(0) as u64;
        let effective_ms = interval.effective_secs.saturating_mul(1000);
        if elapsed_ms < effective_ms {
            let remaining_secs = (effective_ms - elapsed_ms).div_ceil(1000);
            return Err(SkipReason::TooSoon { remaining_secs });
        }
    }

    Ok(interval)
}

/// Load a consistent snapshot for the source and decide admission.
pub fn admit<F>(
    store: &RunStore,
    source_id: i64,
    request: &AdmissionRequest,
    config: &SchedulerConfig,
    capacity: F,
) -> Result<Admission>
where
    F: FnOnce() -> Result<Option<String>>,
{
    let snapshot = store.admission_snapshot(source_id, config.history_window)?;
    let admission = decide(&snapshot, request, config, capacity)?;
    if let Admission::Rejected(reason) = &admission {
        log::debug!("Source {} not admitted: {}", source_id, reason);
    }
    Ok(admission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Counters, Run, RunKind, RunStatus, Source, SourceCategory};
    use chrono::TimeDelta;

    fn source(status: SourceStatus) -> Source {
        let now = Utc::now();
        Source {
            id: 1,
            url: "https://savee.it/pop".to_string(),
            category: SourceCategory::Pop,
            username: None,
            status,
            interval_seconds: Some(60),
            disable_backoff: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn run(id: i64, status: RunStatus, uploaded: u64, completed_at: Option<DateTime<Utc>>) -> Run {
        let now = Utc::now();
        Run {
            id,
            source_id: 1,
            kind: RunKind::Scheduled,
            max_items: 0,
            status,
            counters: Counters {
                uploaded,
                ..Counters::default()
            },
            started_at: Some(now),
            completed_at,
            created_at: now,
            updated_at: now,
            error_message: None,
            exit_code: None,
        }
    }

    fn snapshot(status: SourceStatus, history: Vec<Run>) -> AdmissionSnapshot {
        let active_run = history.iter().find(|r| !r.status.is_terminal()).cloned();
        let last_finished_at = history.iter().filter_map(|r| r.completed_at).max();
        AdmissionSnapshot {
            source: source(status),
            active_run,
            history,
            last_finished_at,
        }
    }

    fn no_capacity_issue() -> Result<Option<String>> {
        Ok(None)
    }

    #[test]
    fn test_inactive_source_rejected_with_status_code() {
        let snap = snapshot(SourceStatus::Paused, vec![]);
        let result = decide(&snap, &AdmissionRequest::at(Utc::now()), &SchedulerConfig::default(), no_capacity_issue).unwrap();
        let Admission::Rejected(reason) = result else {
            panic!("expected rejection");
        };
        assert_eq!(reason.code(), "source_paused");
    }

    #[test]
    fn test_force_does_not_override_inactive_source() {
        let snap = snapshot(SourceStatus::Stopped, vec![]);
        let mut request = AdmissionRequest::at(Utc::now());
        request.force = true;
        let result = decide(&snap, &request, &SchedulerConfig::default(), no_capacity_issue).unwrap();
        assert_eq!(
            result,
            Admission::Rejected(SkipReason::SourceInactive {
                status: SourceStatus::Stopped
            })
        );
    }

    #[test]
    fn test_active_run_rejected_even_with_force() {
        let snap = snapshot(SourceStatus::Active, vec![run(9, RunStatus::Running, 0, None)]);
        let mut request = AdmissionRequest::at(Utc::now());
        request.force = true;
        request.backfill = true;
        let result = decide(&snap, &request, &SchedulerConfig::default(), no_capacity_issue).unwrap();
        assert_eq!(result, Admission::Rejected(SkipReason::AlreadyRunning { run_id: 9 }));
    }

    #[test]
    fn test_interval_boundary_is_inclusive() {
        let t0 = Utc::now();
        // One successful run: no backoff, effective = 60s
        let snap = snapshot(SourceStatus::Active, vec![run(1, RunStatus::Completed, 5, Some(t0))]);
        let config = SchedulerConfig::default();

        let before = AdmissionRequest::at(t0 + TimeDelta::milliseconds(59_999));
        assert_eq!(
            decide(&snap, &before, &config, no_capacity_issue).unwrap(),
            Admission::Rejected(SkipReason::TooSoon { remaining_secs: 1 })
        );

        let at = AdmissionRequest::at(t0 + TimeDelta::seconds(60));
        assert!(decide(&snap, &at, &config, no_capacity_issue).unwrap().is_eligible());
    }

    #[test]
    fn test_backoff_extends_interval() {
        let t0 = Utc::now();
        let history = vec![
            run(3, RunStatus::Completed, 5, Some(t0)),
            run(2, RunStatus::Completed, 0, Some(t0 - TimeDelta::seconds(600))),
            run(1, RunStatus::Error, 0, Some(t0 - TimeDelta::seconds(1200))),
        ];
        let snap = snapshot(SourceStatus::Active, history);
        let config = SchedulerConfig::default();

        let result = decide(&snap, &AdmissionRequest::at(t0 + TimeDelta::seconds(200)), &config, no_capacity_issue).unwrap();
        assert_eq!(result, Admission::Rejected(SkipReason::TooSoon { remaining_secs: 40 }));

        let result = decide(&snap, &AdmissionRequest::at(t0 + TimeDelta::seconds(240)), &config, no_capacity_issue).unwrap();
        let Admission::Eligible { interval } = result else {
            panic!("expected eligible");
        };
        assert_eq!(interval.effective_secs, 240);
    }

    #[test]
    fn test_backfill_and_force_bypass_interval() {
        let t0 = Utc::now();
        let snap = snapshot(SourceStatus::Active, vec![run(1, RunStatus::Completed, 5, Some(t0))]);
        let config = SchedulerConfig::default();

        let mut backfill = AdmissionRequest::at(t0);
        backfill.backfill = true;
        assert!(decide(&snap, &backfill, &config, no_capacity_issue).unwrap().is_eligible());

        let mut force = AdmissionRequest::at(t0);
        force.force = true;
        assert!(decide(&snap, &force, &config, no_capacity_issue).unwrap().is_eligible());
    }

    #[test]
    fn test_budget_exhausted() {
        let snap = snapshot(SourceStatus::Active, vec![]);
        let mut request = AdmissionRequest::at(Utc::now());
        request.budget_exhausted = true;
        let result = decide(&snap, &request, &SchedulerConfig::default(), no_capacity_issue).unwrap();
        assert_eq!(result, Admission::Rejected(SkipReason::ParallelBudget));
    }

    #[test]
    fn test_capacity_rejects_unless_forced() {
        let snap = snapshot(SourceStatus::Active, vec![]);
        let config = SchedulerConfig::default();
        let over = || -> Result<Option<String>> { Ok(Some("rows 10 reached soft limit 5".to_string())) };

        let result = decide(&snap, &AdmissionRequest::at(Utc::now()), &config, over).unwrap();
        assert_eq!(result.clone(), Admission::Rejected(SkipReason::OverCapacity {
            detail: "rows 10 reached soft limit 5".to_string()
        }));
        if let Admission::Rejected(reason) = result {
            assert_eq!(reason.code(), "over_capacity");
        }

        let mut forced = AdmissionRequest::at(Utc::now());
        forced.force = true;
        let result = decide(&snap, &forced, &config, || -> Result<Option<String>> {
            panic!("capacity must not be consulted when forced")
        })
        .unwrap();
        assert!(result.is_eligible());
    }

    #[test]
    fn test_capacity_not_consulted_after_earlier_rejection() {
        let snap = snapshot(SourceStatus::Paused, vec![]);
        let result = decide(&snap, &AdmissionRequest::at(Utc::now()), &SchedulerConfig::default(), || {
            panic!("capacity must not be consulted")
        })
        .unwrap();
        assert!(!result.is_eligible());
    }
}
