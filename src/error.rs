//! Error types for runsched
//!
//! Centralized error handling using thiserror. Admission rejections and lock
//! contention are not errors; they travel as `SkipReason` values.

use thiserror::Error;

/// All error types that can occur in runsched
#[derive(Debug, Error)]
pub enum RunschedError {
    /// Missing or malformed caller input (target locator, identifiers, ceilings)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Source not found in the run store
    #[error("Source not found: {0}")]
    SourceNotFound(i64),

    /// Run not found in the run store
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Capacity soft limits exceeded and no force flag supplied
    #[error("Over capacity: {0}")]
    OverCapacity(String),

    /// Bearer token missing or wrong
    #[error("Unauthorized")]
    Unauthorized,

    /// Worker process could not be started
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// SQLite error
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// HTTP client error (dispatcher webhook)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Blocking store task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RunschedError {
    /// HTTP status code for the control surface.
    pub fn status_code(&self) -> u16 {
        match self {
            RunschedError::InvalidInput(_) => 400,
            RunschedError::Unauthorized => 401,
            RunschedError::SourceNotFound(_) | RunschedError::RunNotFound(_) => 404,
            RunschedError::InvalidState(_) => 409,
            RunschedError::OverCapacity(_) => 429,
            _ => 500,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.status_code() {
            400 => 2,
            401 => 3,
            404 => 4,
            409 => 5,
            429 => 6,
            _ => 1,
        }
    }
}

/// Result type alias for runsched operations
pub type Result<T> = std::result::Result<T, RunschedError>;
