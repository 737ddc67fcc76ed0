//! RunStore: SQLite persistence for sources, runs, job logs and outputs.
//!
//! A `RunStore` is one session: its own connection in WAL mode with a busy
//! timeout, and a random holder id that owns any advisory locks taken through
//! it. Every unit of work (a dispatch, a control action, an exit callback)
//! opens its own session from a shared [`Database`].

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{Result, RunschedError};
use crate::id::{from_ms, generate_session_id, now_ms};
use crate::locator::TargetLocator;
use crate::store::records::{
    Counters, JobLogEntry, JobOutcome, JobStage, NewJobLog, NewOutput, OutputRecord, PendingRun, Run, RunKind,
    RunStatus, Source, SourceCategory, SourceStatus,
};

const SOURCE_COLUMNS: &str =
    "id, url, category, username, status, interval_seconds, disable_backoff, created_at, updated_at";

const RUN_COLUMNS: &str = "id, source_id, kind, max_items, status, found, uploaded, errors, skipped, \
     started_at, completed_at, created_at, updated_at, error_message, exit_code";

const NON_TERMINAL: &str = "('pending', 'running', 'paused')";

/// Shared handle for opening store sessions.
#[derive(Debug, Clone)]
pub struct Database {
    config: StoreConfig,
}

impl Database {
    /// Create the database file if needed and initialize the schema.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let store = RunStore::connect(config)?;
        store.init_schema()?;
        log::debug!("Opened run store at {}", config.path.display());

        Ok(Self { config: config.clone() })
    }

    /// Open a fresh session on the store.
    pub fn session(&self) -> Result<RunStore> {
        RunStore::connect(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// Result of creating or reusing a run row.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedRow {
    pub run: Run,
    /// True when a terminal run row was reset instead of inserting a new one
    pub reused: bool,
}

/// Parameters for a new run.
#[derive(Debug, Clone, Copy)]
pub struct NewRun {
    pub source_id: i64,
    pub kind: RunKind,
    pub max_items: u64,
    pub status: RunStatus,
    /// Run rows kept per source before terminal rows are recycled
    pub history_window: usize,
}

/// Everything admission needs about a source, read in one transaction.
#[derive(Debug, Clone)]
pub struct AdmissionSnapshot {
    pub source: Source,
    pub active_run: Option<Run>,
    /// Most recent first
    pub history: Vec<Run>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// Row and byte totals used by the capacity oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageUsage {
    pub output_bytes: u64,
    pub output_rows: u64,
    pub run_rows: u64,
    pub job_log_rows: u64,
}

/// One session on the run store.
pub struct RunStore {
    pub(super) conn: Connection,
    pub(super) holder: String,
    pub(super) lock_lease_ms: i64,
}

impl RunStore {
    /// Open a session without touching the schema.
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            conn,
            holder: generate_session_id(),
            lock_lease_ms: (config.lock_lease_secs as i64).saturating_mul(1000),
        })
    }

    /// Open a session and make sure the schema exists.
    ///
    /// Useful for tests and one-shot tools that do not hold a `Database`.
    pub fn open_at(config: &StoreConfig) -> Result<Self> {
        let db = Database::open(config)?;
        db.session()
    }

    /// Holder id that owns this session's advisory locks.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                category TEXT NOT NULL,
                username TEXT,
                status TEXT NOT NULL,
                interval_seconds INTEGER,
                disable_backoff INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sources_status ON sources(status, updated_at);

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                max_items INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                found INTEGER NOT NULL DEFAULT 0,
                uploaded INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                completed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                error_message TEXT,
                exit_code INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_runs_source ON runs(source_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);

            CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                stage TEXT NOT NULL,
                item_url TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL,
                timing_secs REAL,
                message TEXT,
                progress TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_logs_run ON job_logs(run_id, id);

            CREATE TABLE IF NOT EXISTS run_outputs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER REFERENCES runs(id) ON DELETE SET NULL,
                source_id INTEGER REFERENCES sources(id) ON DELETE SET NULL,
                external_id TEXT NOT NULL,
                storage_key TEXT,
                bytes INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_outputs_run ON run_outputs(run_id);
            CREATE INDEX IF NOT EXISTS idx_run_outputs_source ON run_outputs(source_id);

            CREATE TABLE IF NOT EXISTS advisory_locks (
                namespace INTEGER NOT NULL,
                key INTEGER NOT NULL,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )?;

        Ok(())
    }

    /// Begin a write transaction that takes the write lock up front.
    pub(super) fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?)
    }

    // ---------------------------------------------------------------------
    // Sources
    // ---------------------------------------------------------------------

    /// Create a source from a validated locator.
    pub fn create_source(
        &self,
        locator: &TargetLocator,
        interval_seconds: Option<u64>,
        disable_backoff: bool,
    ) -> Result<Source> {
        let now = now_ms();
        let inserted = self.conn.execute(
            r#"
            INSERT INTO sources
            (url, category, username, status, interval_seconds, disable_backoff, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                locator.url,
                locator.category.as_str(),
                locator.username,
                SourceStatus::Active.as_str(),
                interval_seconds.map(|s| s as i64),
                disable_backoff,
                now,
            ],
        );

        match inserted {
            Ok(_) => self.require_source(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(RunschedError::InvalidInput(format!(
                "source with url '{}' already exists",
                locator.url
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the source for this locator, creating it on first sight.
    pub fn create_or_get_source(&self, locator: &TargetLocator) -> Result<(Source, bool)> {
        if let Some(existing) = self.find_source_by_url(&locator.url)? {
            return Ok((existing, false));
        }
        match self.create_source(locator, None, false) {
            Ok(source) => Ok((source, true)),
            // Lost a race with another session creating the same url
            Err(RunschedError::InvalidInput(_)) => {
                let source = self
                    .find_source_by_url(&locator.url)?
                    .ok_or_else(|| RunschedError::InvalidState(format!("source '{}' vanished", locator.url)))?;
                Ok((source, false))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let sql = format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], source_from_row).optional()?)
    }

    /// Get a source or fail with `SourceNotFound`.
    pub fn require_source(&self, id: i64) -> Result<Source> {
        self.get_source(id)?.ok_or(RunschedError::SourceNotFound(id))
    }

    pub fn find_source_by_url(&self, url: &str) -> Result<Option<Source>> {
        let sql = format!("SELECT {} FROM sources WHERE url = ?1", SOURCE_COLUMNS);
        Ok(self.conn.query_row(&sql, [url], source_from_row).optional()?)
    }

    /// List all sources, most recently updated first.
    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let sql = format!("SELECT {} FROM sources ORDER BY updated_at DESC, id DESC", SOURCE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], source_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active sources outside the excluded categories, most recently updated first.
    pub fn list_active_sources(&self, excluded: &[SourceCategory], limit: usize) -> Result<Vec<Source>> {
        let sql = format!(
            "SELECT {} FROM sources WHERE status = 'active' ORDER BY updated_at DESC, id DESC",
            SOURCE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], source_from_row)?;

        let mut sources = Vec::new();
        for row in rows {
            let source = row?;
            if excluded.contains(&source.category) {
                continue;
            }
            sources.push(source);
            if sources.len() >= limit {
                break;
            }
        }

        Ok(sources)
    }

    /// Set the operator status of a source. Setting the current status is a no-op.
    pub fn set_source_status(&self, id: i64, status: SourceStatus) -> Result<Source> {
        let current = self.require_source(id)?;
        if current.status == status {
            return Ok(current);
        }
        self.conn.execute(
            "UPDATE sources SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_ms(), id],
        )?;
        self.require_source(id)
    }

    /// Point a source at a new locator; category and username follow the url.
    pub fn update_source_locator(&self, id: i64, locator: &TargetLocator) -> Result<Source> {
        self.require_source(id)?;
        let updated = self.conn.execute(
            "UPDATE sources SET url = ?1, category = ?2, username = ?3, updated_at = ?4 WHERE id = ?5",
            params![locator.url, locator.category.as_str(), locator.username, now_ms(), id],
        );
        match updated {
            Ok(_) => self.require_source(id),
            Err(e) if is_unique_violation(&e) => Err(RunschedError::InvalidInput(format!(
                "another source already uses url '{}'",
                locator.url
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the per-source schedule settings.
    pub fn update_source_schedule(
        &self,
        id: i64,
        interval_seconds: Option<u64>,
        disable_backoff: bool,
    ) -> Result<Source> {
        let changed = self.conn.execute(
            "UPDATE sources SET interval_seconds = ?1, disable_backoff = ?2, updated_at = ?3 WHERE id = ?4",
            params![interval_seconds.map(|s| s as i64), disable_backoff, now_ms(), id],
        )?;
        if changed == 0 {
            return Err(RunschedError::SourceNotFound(id));
        }
        self.require_source(id)
    }

    /// Delete a source and its runs and job logs.
    ///
    /// Output records are deleted too when `delete_outputs` is set, otherwise
    /// they stay behind detached from the source.
    pub fn delete_source(&self, id: i64, delete_outputs: bool) -> Result<()> {
        let tx = self.write_tx()?;
        if delete_outputs {
            tx.execute("DELETE FROM run_outputs WHERE source_id = ?1", [id])?;
        }
        let deleted = tx.execute("DELETE FROM sources WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(RunschedError::SourceNotFound(id));
        }
        tx.commit()?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Create a run for a source, recycling a terminal row once the source
    /// already holds `history_window` runs.
    ///
    /// Fails with `InvalidState` if the source still has a non-terminal run.
    pub fn start_run(&self, new: &NewRun, now: DateTime<Utc>) -> Result<StartedRow> {
        let now = now.timestamp_millis();
        let tx = self.write_tx()?;

        let active: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM runs WHERE source_id = ?1 AND status IN {} LIMIT 1",
                    NON_TERMINAL
                ),
                [new.source_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(run_id) = active {
            return Err(RunschedError::InvalidState(format!(
                "source {} already has active run {}",
                new.source_id, run_id
            )));
        }

        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM runs WHERE source_id = ?1", [new.source_id], |row| {
            row.get(0)
        })?;

        let window = new.history_window.max(1) as i64;
        let recycled: Option<i64> = if existing >= window {
            tx.query_row(
                "SELECT id FROM runs WHERE source_id = ?1 ORDER BY created_at ASC, id ASC LIMIT 1",
                [new.source_id],
                |row| row.get(0),
            )
            .optional()?
        } else {
            None
        };

        let started_at = (new.status == RunStatus::Running).then_some(now);
        let run_id = match recycled {
            Some(run_id) => {
                tx.execute("DELETE FROM job_logs WHERE run_id = ?1", [run_id])?;
                tx.execute("UPDATE run_outputs SET run_id = NULL WHERE run_id = ?1", [run_id])?;
                tx.execute(
                    r#"
                    UPDATE runs SET kind = ?1, max_items = ?2, status = ?3,
                        found = 0, uploaded = 0, errors = 0, skipped = 0,
                        started_at = ?4, completed_at = NULL, created_at = ?5, updated_at = ?5,
                        error_message = NULL, exit_code = NULL
                    WHERE id = ?6
                    "#,
                    params![
                        new.kind.as_str(),
                        new.max_items as i64,
                        new.status.as_str(),
                        started_at,
                        now,
                        run_id
                    ],
                )?;
                run_id
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO runs (source_id, kind, max_items, status, started_at, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    "#,
                    params![
                        new.source_id,
                        new.kind.as_str(),
                        new.max_items as i64,
                        new.status.as_str(),
                        started_at,
                        now
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let run = tx.query_row(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS), [run_id], run_from_row)?;
        tx.commit()?;

        Ok(StartedRow {
            run,
            reused: recycled.is_some(),
        })
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], run_from_row).optional()?)
    }

    /// Get a run or fail with `RunNotFound`.
    pub fn require_run(&self, id: i64) -> Result<Run> {
        self.get_run(id)?.ok_or(RunschedError::RunNotFound(id))
    }

    /// Most recently created run of a source.
    pub fn latest_run(&self, source_id: i64) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE source_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
            RUN_COLUMNS
        );
        Ok(self.conn.query_row(&sql, [source_id], run_from_row).optional()?)
    }

    /// The non-terminal run of a source, if any.
    pub fn active_run(&self, source_id: i64) -> Result<Option<Run>> {
        active_run_in(&self.conn, source_id)
    }

    /// Runs of a source, newest first.
    pub fn list_runs(&self, source_id: i64, limit: usize) -> Result<Vec<Run>> {
        recent_runs_in(&self.conn, source_id, limit)
    }

    /// Pending runs with their target url, oldest first.
    pub fn list_pending_runs(&self, limit: usize) -> Result<Vec<PendingRun>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT r.id, r.source_id, s.url, r.max_items, r.created_at
            FROM runs r JOIN sources s ON s.id = r.source_id
            WHERE r.status = 'pending'
            ORDER BY r.created_at ASC, r.id ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(PendingRun {
                run_id: row.get(0)?,
                source_id: row.get(1)?,
                url: row.get(2)?,
                max_items: row.get::<_, i64>(3)?.max(0) as u64,
                created_at: from_ms(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomically move a pending run to running. False if someone else claimed it.
    pub fn claim_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let now = now.timestamp_millis();
        let changed = self.conn.execute(
            "UPDATE runs SET status = 'running', started_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
            params![now, run_id],
        )?;
        Ok(changed == 1)
    }

    /// Record that execution began. Only pending or running runs are touched.
    pub fn mark_started(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let now = now.timestamp_millis();
        let changed = self.conn.execute(
            "UPDATE runs SET status = 'running', started_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status IN ('pending', 'running')",
            params![now, run_id],
        )?;
        Ok(changed == 1)
    }

    /// Move a non-terminal run to a terminal status.
    ///
    /// Returns false when the run was already terminal; the earlier outcome wins.
    pub fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<&str>,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(RunschedError::InvalidState(format!("{} is not a terminal status", status)));
        }
        let now = now.timestamp_millis();
        let changed = self.conn.execute(
            &format!(
                "UPDATE runs SET status = ?1, error_message = ?2, exit_code = ?3, completed_at = ?4, updated_at = ?4 \
                 WHERE id = ?5 AND status IN {}",
                NON_TERMINAL
            ),
            params![status.as_str(), error_message, exit_code, now, run_id],
        )?;
        if changed == 0 {
            self.require_run(run_id)?;
        }
        Ok(changed == 1)
    }

    /// Compare-and-set a run status between two non-terminal states.
    pub fn transition_run(&self, run_id: i64, from: RunStatus, to: RunStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now_ms(), run_id, from.as_str()],
        )?;
        if changed == 0 {
            self.require_run(run_id)?;
        }
        Ok(changed == 1)
    }

    /// Set a run's item ceiling. A finished run keeps its timestamps.
    pub fn set_run_max_items(&self, run_id: i64, max_items: u64) -> Result<()> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE runs SET max_items = ?1,
                    updated_at = CASE WHEN status IN {} THEN ?2 ELSE updated_at END
                 WHERE id = ?3",
                NON_TERMINAL
            ),
            params![max_items as i64, now_ms(), run_id],
        )?;
        if changed == 0 {
            return Err(RunschedError::RunNotFound(run_id));
        }
        Ok(())
    }

    /// Merge reported counters into a running run; counters never decrease.
    pub fn report_progress(&self, run_id: i64, reported: &Counters) -> Result<Counters> {
        let tx = self.write_tx()?;
        let run = tx
            .query_row(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS), [run_id], run_from_row)
            .optional()?
            .ok_or(RunschedError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(RunschedError::InvalidState(format!(
                "run {} is {}, progress only accepted while running",
                run_id, run.status
            )));
        }

        let merged = run.counters.merge_monotonic(reported);
        tx.execute(
            "UPDATE runs SET found = ?1, uploaded = ?2, errors = ?3, skipped = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                merged.found as i64,
                merged.uploaded as i64,
                merged.errors as i64,
                merged.skipped as i64,
                now_ms(),
                run_id
            ],
        )?;
        tx.commit()?;

        Ok(merged)
    }

    /// Close a run from its output records: uploaded = count(outputs), completed.
    pub fn reconcile_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<Run> {
        let now = now.timestamp_millis();
        let tx = self.write_tx()?;
        let uploaded: i64 = tx.query_row("SELECT COUNT(*) FROM run_outputs WHERE run_id = ?1", [run_id], |row| {
            row.get(0)
        })?;
        let changed = tx.execute(
            "UPDATE runs SET uploaded = ?1, status = 'completed', completed_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![uploaded, now, run_id],
        )?;
        if changed == 0 {
            return Err(RunschedError::RunNotFound(run_id));
        }
        let run = tx.query_row(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS), [run_id], run_from_row)?;
        tx.commit()?;
        Ok(run)
    }

    /// Running runs whose last update is older than the threshold.
    pub fn find_stale_runs(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let cutoff = now.timestamp_millis() - threshold.as_millis() as i64;
        let sql = format!(
            "SELECT {} FROM runs WHERE status = 'running' AND updated_at < ?1 ORDER BY updated_at ASC",
            RUN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([cutoff], run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Read source, active run and recent history in one read transaction.
    pub fn admission_snapshot(&self, source_id: i64, window: usize) -> Result<AdmissionSnapshot> {
        let tx = self.conn.unchecked_transaction()?;
        let source = tx
            .query_row(
                &format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS),
                [source_id],
                source_from_row,
            )
            .optional()?
            .ok_or(RunschedError::SourceNotFound(source_id))?;
        let active_run = active_run_in(&tx, source_id)?;
        let history = recent_runs_in(&tx, source_id, window)?;
        let last_finished_at: Option<i64> = tx.query_row(
            "SELECT MAX(completed_at) FROM runs WHERE source_id = ?1 AND completed_at IS NOT NULL",
            [source_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(AdmissionSnapshot {
            source,
            active_run,
            history,
            last_finished_at: last_finished_at.map(from_ms),
        })
    }

    // ---------------------------------------------------------------------
    // Job logs and outputs
    // ---------------------------------------------------------------------

    /// Append a job log entry. Bumps the run's `updated_at` while it runs.
    pub fn append_job_log(&self, run_id: i64, entry: &NewJobLog) -> Result<JobLogEntry> {
        let now = now_ms();
        let tx = self.write_tx()?;
        let exists: Option<i64> = tx
            .query_row("SELECT id FROM runs WHERE id = ?1", [run_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(RunschedError::RunNotFound(run_id));
        }

        tx.execute(
            r#"
            INSERT INTO job_logs (run_id, stage, item_url, outcome, timing_secs, message, progress, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                run_id,
                entry.stage.as_str(),
                entry.item_url,
                entry.outcome.glyph(),
                entry.timing_secs,
                entry.message,
                entry.progress,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE runs SET updated_at = ?1 WHERE id = ?2 AND status = 'running'",
            params![now, run_id],
        )?;
        tx.commit()?;

        Ok(JobLogEntry {
            id,
            run_id,
            stage: entry.stage,
            item_url: entry.item_url.clone(),
            outcome: entry.outcome,
            timing_secs: entry.timing_secs,
            message: entry.message.clone(),
            progress: entry.progress.clone(),
            created_at: from_ms(now),
        })
    }

    /// Newest job log entries of a run, newest first.
    pub fn list_job_logs(&self, run_id: i64, limit: usize) -> Result<Vec<JobLogEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, run_id, stage, item_url, outcome, timing_secs, message, progress, created_at
            FROM job_logs WHERE run_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            Ok(JobLogEntry {
                id: row.get(0)?,
                run_id: row.get(1)?,
                stage: parse_column(row, 2, JobStage::parse)?,
                item_url: row.get(3)?,
                outcome: parse_column(row, 4, JobOutcome::parse)?,
                timing_secs: row.get(5)?,
                message: row.get(6)?,
                progress: row.get(7)?,
                created_at: from_ms(row.get(8)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Record one produced item of a run.
    pub fn record_output(&self, run_id: i64, output: &NewOutput) -> Result<OutputRecord> {
        let run = self.require_run(run_id)?;
        let now = now_ms();
        self.conn.execute(
            r#"
            INSERT INTO run_outputs (run_id, source_id, external_id, storage_key, bytes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                run_id,
                run.source_id,
                output.external_id,
                output.storage_key,
                output.bytes as i64,
                now
            ],
        )?;

        Ok(OutputRecord {
            id: self.conn.last_insert_rowid(),
            run_id: Some(run_id),
            source_id: Some(run.source_id),
            external_id: output.external_id.clone(),
            storage_key: output.storage_key.clone(),
            bytes: output.bytes,
            created_at: from_ms(now),
        })
    }

    pub fn count_outputs(&self, run_id: i64) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM run_outputs WHERE run_id = ?1", [run_id], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Totals across the whole store.
    pub fn storage_usage(&self) -> Result<StorageUsage> {
        let tx = self.conn.unchecked_transaction()?;
        let (output_rows, output_bytes): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(bytes), 0) FROM run_outputs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let run_rows: i64 = tx.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        let job_log_rows: i64 = tx.query_row("SELECT COUNT(*) FROM job_logs", [], |row| row.get(0))?;
        tx.commit()?;

        Ok(StorageUsage {
            output_bytes: output_bytes.max(0) as u64,
            output_rows: output_rows as u64,
            run_rows: run_rows as u64,
            job_log_rows: job_log_rows as u64,
        })
    }
}

impl Drop for RunStore {
    fn drop(&mut self) {
        // Session-scoped locks go away with the session
        if let Err(e) = self
            .conn
            .execute("DELETE FROM advisory_locks WHERE holder = ?1", [&self.holder])
        {
            log::warn!("Failed to release advisory locks of {}: {}", self.holder, e);
        }
    }
}

fn active_run_in(conn: &Connection, source_id: i64) -> Result<Option<Run>> {
    let sql = format!(
        "SELECT {} FROM runs WHERE source_id = ?1 AND status IN {} ORDER BY created_at DESC, id DESC LIMIT 1",
        RUN_COLUMNS, NON_TERMINAL
    );
    Ok(conn.query_row(&sql, [source_id], run_from_row).optional()?)
}

fn recent_runs_in(conn: &Connection, source_id: i64, limit: usize) -> Result<Vec<Run>> {
    let sql = format!(
        "SELECT {} FROM runs WHERE source_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        RUN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![source_id, limit as i64], run_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Read a text column through one of the record `parse` functions.
fn parse_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, raw, Type::Text))
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        url: row.get(1)?,
        category: parse_column(row, 2, SourceCategory::parse)?,
        username: row.get(3)?,
        status: parse_column(row, 4, SourceStatus::parse)?,
        interval_seconds: row.get::<_, Option<i64>>(5)?.map(|s| s.max(0) as u64),
        disable_backoff: row.get(6)?,
        created_at: from_ms(row.get(7)?),
        updated_at: from_ms(row.get(8)?),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let count = |idx: usize| -> rusqlite::Result<u64> { Ok(row.get::<_, i64>(idx)?.max(0) as u64) };
    Ok(Run {
        id: row.get(0)?,
        source_id: row.get(1)?,
        kind: parse_column(row, 2, RunKind::parse)?,
        max_items: count(3)?,
        status: parse_column(row, 4, RunStatus::parse)?,
        counters: Counters {
            found: count(5)?,
            uploaded: count(6)?,
            errors: count(7)?,
            skipped: count(8)?,
        },
        started_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
        completed_at: row.get::<_, Option<i64>>(10)?.map(from_ms),
        created_at: from_ms(row.get(11)?),
        updated_at: from_ms(row.get(12)?),
        error_message: row.get(13)?,
        exit_code: row.get(14)?,
    })
}
