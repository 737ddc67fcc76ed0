use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RunschedError;
use crate::executor::ExecutionMode;
use crate::store::SourceCategory;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub capacity: CapacityConfig,
    pub runner: RunnerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    /// Advisory locks older than this are treated as abandoned by a dead holder.
    pub lock_lease_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("runsched")
                .join("runsched.db"),
            busy_timeout_ms: 5000,
            lock_lease_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base interval for sources without an override.
    pub min_interval_secs: u64,
    /// Ceiling for the backed-off interval.
    pub max_interval_secs: u64,
    /// Lowest base interval accepted, even from a per-source override.
    pub interval_floor_secs: u64,
    /// Number of recent runs fed to the backoff calculator.
    pub history_window: usize,
    /// How many sources one sweep may newly dispatch.
    pub parallel_start_budget: usize,
    pub batch_size: usize,
    pub excluded_categories: Vec<SourceCategory>,
    pub stale_threshold_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 900,
            max_interval_secs: 86_400,
            interval_floor_secs: 10,
            history_window: 3,
            parallel_start_budget: 2,
            batch_size: 100,
            excluded_categories: Vec::new(),
            stale_threshold_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    /// Worker program; receives `--start-url`, `--max-items`, `--run-id` after `worker_args`.
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Optional external dispatcher notified when a pending run is queued.
    pub dispatch_webhook: Option<String>,
    pub webhook_token: Option<String>,
    pub webhook_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Inline,
            worker_program: "python3".to_string(),
            worker_args: vec!["-m".to_string(), "app.cli".to_string()],
            working_dir: None,
            dispatch_webhook: None,
            webhook_token: None,
            webhook_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub storage_soft_limit_bytes: u64,
    pub row_soft_limit: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            storage_soft_limit_bytes: 10 * 1024 * 1024 * 1024,
            row_soft_limit: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub poll_interval_secs: u64,
    pub max_parallel: usize,
    pub pending_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 20,
            max_parallel: 2,
            pending_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// When set, every control endpoint requires `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            auth_token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            capacity: CapacityConfig::default(),
            runner: RunnerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> std::result::Result<(), RunschedError> {
        let s = &self.scheduler;
        if s.interval_floor_secs < 10 {
            return Err(RunschedError::Config(format!(
                "scheduler.interval_floor_secs must be at least 10, got {}",
                s.interval_floor_secs
            )));
        }
        if s.min_interval_secs > s.max_interval_secs {
            return Err(RunschedError::Config(format!(
                "scheduler.min_interval_secs ({}) exceeds max_interval_secs ({})",
                s.min_interval_secs, s.max_interval_secs
            )));
        }
        if s.interval_floor_secs > s.max_interval_secs {
            return Err(RunschedError::Config(
                "scheduler.interval_floor_secs exceeds max_interval_secs".to_string(),
            ));
        }
        if s.parallel_start_budget == 0 {
            return Err(RunschedError::Config(
                "scheduler.parallel_start_budget must be at least 1".to_string(),
            ));
        }
        if self.runner.max_parallel == 0 {
            return Err(RunschedError::Config("runner.max_parallel must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.history_window, 3);
        assert_eq!(config.scheduler.stale_threshold_secs, 300);
        assert_eq!(config.executor.mode, ExecutionMode::Inline);
    }

    #[test]
    fn test_load_partial_yaml_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("runsched.yml");
        fs::write(
            &path,
            r#"
scheduler:
  min_interval_secs: 60
  excluded_categories: [home]
executor:
  mode: external
  dispatch_webhook: "http://127.0.0.1:9/hook"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.min_interval_secs, 60);
        assert_eq!(config.scheduler.max_interval_secs, 86_400);
        assert_eq!(config.scheduler.excluded_categories, vec![SourceCategory::Home]);
        assert_eq!(config.executor.mode, ExecutionMode::External);
        assert_eq!(config.runner.max_parallel, 2);
    }

    #[test]
    fn test_load_rejects_floor_below_ten_seconds() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("runsched.yml");
        fs::write(&path, "scheduler:\n  interval_floor_secs: 5\n").unwrap();

        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = Config::default();
        config.scheduler.min_interval_secs = 10_000;
        config.scheduler.max_interval_secs = 600;
        assert!(matches!(config.validate(), Err(RunschedError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = Config::default();
        config.scheduler.parallel_start_budget = 0;
        assert!(config.validate().is_err());
    }
}
