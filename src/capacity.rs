//! Capacity guard.
//!
//! Admission asks a [`CapacityOracle`] for current usage and compares it with
//! the configured soft limits. The default oracle reads totals from the run
//! store; deployments mirroring media elsewhere can plug in their own.

use serde::Serialize;

use crate::config::CapacityConfig;
use crate::error::Result;
use crate::store::RunStore;

/// Storage and row usage as seen by an oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapacityUsage {
    pub storage_bytes: u64,
    pub rows: u64,
}

impl CapacityUsage {
    /// Describe the first exceeded soft limit, if any.
    pub fn check(&self, limits: &CapacityConfig) -> Option<String> {
        if self.storage_bytes >= limits.storage_soft_limit_bytes {
            return Some(format!(
                "storage {} bytes reached soft limit {}",
                self.storage_bytes, limits.storage_soft_limit_bytes
            ));
        }
        if self.rows >= limits.row_soft_limit {
            return Some(format!("rows {} reached soft limit {}", self.rows, limits.row_soft_limit));
        }
        None
    }
}

/// Source of capacity usage figures.
pub trait CapacityOracle: Send + Sync {
    fn usage(&self, store: &RunStore) -> Result<CapacityUsage>;
}

/// Oracle backed by output record totals in the run store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCapacityOracle;

impl CapacityOracle for StoreCapacityOracle {
    fn usage(&self, store: &RunStore) -> Result<CapacityUsage> {
        let totals = store.storage_usage()?;
        Ok(CapacityUsage {
            storage_bytes: totals.output_bytes,
            rows: totals.output_rows + totals.run_rows + totals.job_log_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::locator::TargetLocator;
    use crate::store::{NewOutput, NewRun, RunKind, RunStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn limits(bytes: u64, rows: u64) -> CapacityConfig {
        CapacityConfig {
            storage_soft_limit_bytes: bytes,
            row_soft_limit: rows,
        }
    }

    #[test]
    fn test_check_under_limits() {
        let usage = CapacityUsage {
            storage_bytes: 10,
            rows: 10,
        };
        assert!(usage.check(&limits(100, 100)).is_none());
    }

    #[test]
    fn test_check_reports_storage_first() {
        let usage = CapacityUsage {
            storage_bytes: 100,
            rows: 500,
        };
        let reason = usage.check(&limits(100, 100)).unwrap();
        assert!(reason.starts_with("storage"));
    }

    #[test]
    fn test_check_reports_rows() {
        let usage = CapacityUsage {
            storage_bytes: 0,
            rows: 100,
        };
        let reason = usage.check(&limits(1000, 100)).unwrap();
        assert!(reason.starts_with("rows"));
    }

    #[test]
    fn test_store_oracle_sums_outputs() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::open_at(&StoreConfig {
            path: temp.path().join("runsched.db"),
            ..StoreConfig::default()
        })
        .unwrap();
        let source = store
            .create_source(&TargetLocator::parse("https://savee.it/pop").unwrap(), None, false)
            .unwrap();
        let run = store
            .start_run(
                &NewRun {
                    source_id: source.id,
                    kind: RunKind::Manual,
                    max_items: 0,
                    status: RunStatus::Running,
                    history_window: 3,
                },
                Utc::now(),
            )
            .unwrap()
            .run;
        for bytes in [100, 250] {
            store
                .record_output(
                    run.id,
                    &NewOutput {
                        external_id: format!("item-{}", bytes),
                        storage_key: None,
                        bytes,
                    },
                )
                .unwrap();
        }

        let usage = StoreCapacityOracle.usage(&store).unwrap();
        assert_eq!(usage.storage_bytes, 350);
        assert_eq!(usage.rows, 3);
    }
}
