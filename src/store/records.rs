//! Record types for RunStore persistence.
//!
//! `Source` is the long-lived scrape target, `Run` one execution attempt of a
//! source, `JobLogEntry` an append-only observability event of a run and
//! `OutputRecord` one item a run produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of source categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    Home,
    Pop,
    User,
}

impl SourceCategory {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCategory::Home => "home",
            SourceCategory::Pop => "pop",
            SourceCategory::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "home" => Some(SourceCategory::Home),
            "pop" => Some(SourceCategory::Pop),
            "user" => Some(SourceCategory::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operator-facing lifecycle of a source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Eligible for scheduling
    Active,
    /// Operator paused; existing run left alone
    Paused,
    /// Operator stopped; active run closed
    Stopped,
    /// Too many consecutive failed runs
    Error,
    Completed,
}

impl SourceStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Paused => "paused",
            SourceStatus::Stopped => "stopped",
            SourceStatus::Error => "error",
            SourceStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SourceStatus::Active),
            "paused" => Some(SourceStatus::Paused),
            "stopped" => Some(SourceStatus::Stopped),
            "error" => Some(SourceStatus::Error),
            "completed" => Some(SourceStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A configured, recurring scrape target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub category: SourceCategory,
    pub username: Option<String>,
    pub status: SourceStatus,
    /// Per-source base interval override in seconds
    pub interval_seconds: Option<u64>,
    pub disable_backoff: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Manual,
    Scheduled,
    Backfill,
}

impl RunKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Manual => "manual",
            RunKind::Scheduled => "scheduled",
            RunKind::Backfill => "backfill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(RunKind::Manual),
            "scheduled" => Some(RunKind::Scheduled),
            "backfill" => Some(RunKind::Backfill),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run status state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Queued for an external executor
    Pending,
    /// Worker executing
    Running,
    /// Operator paused
    Paused,
    /// Worker exited cleanly or run was reconciled
    Completed,
    /// Worker failed or dispatch failed
    Error,
    /// Operator stopped
    Stopped,
}

impl RunStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "completed" => Some(RunStatus::Completed),
            "error" => Some(RunStatus::Error),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error | RunStatus::Stopped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run progress counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub found: u64,
    pub uploaded: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl Counters {
    /// Field-wise maximum; counters of a running run never go down.
    pub fn merge_monotonic(&self, reported: &Counters) -> Counters {
        Counters {
            found: self.found.max(reported.found),
            uploaded: self.uploaded.max(reported.uploaded),
            errors: self.errors.max(reported.errors),
            skipped: self.skipped.max(reported.skipped),
        }
    }
}

/// One execution attempt of a source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    pub source_id: i64,
    pub kind: RunKind,
    /// Item ceiling, 0 = unbounded
    pub max_items: u64,
    pub status: RunStatus,
    pub counters: Counters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
}

/// A pending run as seen by an external executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRun {
    pub run_id: i64,
    pub source_id: i64,
    pub url: String,
    pub max_items: u64,
    pub created_at: DateTime<Utc>,
}

/// Worker stage that emitted a job log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStage {
    Starting,
    Fetch,
    Scrape,
    Upload,
    Write,
    Error,
    Complete,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Starting => "STARTING",
            JobStage::Fetch => "FETCH",
            JobStage::Scrape => "SCRAPE",
            JobStage::Upload => "UPLOAD",
            JobStage::Write => "WRITE",
            JobStage::Error => "ERROR",
            JobStage::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTING" => Some(JobStage::Starting),
            "FETCH" => Some(JobStage::Fetch),
            "SCRAPE" => Some(JobStage::Scrape),
            "UPLOAD" => Some(JobStage::Upload),
            "WRITE" => Some(JobStage::Write),
            "ERROR" => Some(JobStage::Error),
            "COMPLETE" => Some(JobStage::Complete),
            _ => None,
        }
    }
}

/// Outcome glyph of a job log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobOutcome {
    #[serde(rename = "✓")]
    Ok,
    #[serde(rename = "❌")]
    Failed,
    #[serde(rename = "⚠")]
    Warning,
}

impl JobOutcome {
    pub fn glyph(&self) -> &'static str {
        match self {
            JobOutcome::Ok => "✓",
            JobOutcome::Failed => "❌",
            JobOutcome::Warning => "⚠",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "✓" => Some(JobOutcome::Ok),
            "❌" => Some(JobOutcome::Failed),
            "⚠" => Some(JobOutcome::Warning),
            _ => None,
        }
    }
}

/// Job log event as reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJobLog {
    pub stage: JobStage,
    #[serde(default)]
    pub item_url: String,
    pub outcome: JobOutcome,
    #[serde(default)]
    pub timing_secs: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
}

/// Persisted, immutable job log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobLogEntry {
    pub id: i64,
    pub run_id: i64,
    pub stage: JobStage,
    pub item_url: String,
    pub outcome: JobOutcome,
    pub timing_secs: Option<f64>,
    pub message: Option<String>,
    pub progress: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Output record as reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewOutput {
    pub external_id: String,
    #[serde(default)]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub bytes: u64,
}

/// One produced item of a run. Source of truth for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRecord {
    pub id: i64,
    pub run_id: Option<i64>,
    pub source_id: Option<i64>,
    pub external_id: String,
    pub storage_key: Option<String>,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}
