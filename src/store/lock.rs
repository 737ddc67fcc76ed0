//! Session-scoped advisory locks on the run store.
//!
//! SQLite has no advisory lock primitive, so a lock is a row in
//! `advisory_locks` keyed by `(namespace, key)`. Acquisition is try-only and
//! never queues. A lock whose holder died without cleaning up is taken over
//! once it is older than the configured lease.

use rusqlite::params;

use crate::error::Result;
use crate::id::now_ms;
use crate::store::run_store::RunStore;

/// Lock namespace for per-source dispatch.
pub const DISPATCH_LOCK_NAMESPACE: i64 = 4242;

/// A held advisory lock. Released on drop.
pub struct AdvisoryLock<'a> {
    store: &'a RunStore,
    namespace: i64,
    key: i64,
    released: bool,
}

impl std::fmt::Debug for AdvisoryLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLock")
            .field("holder", &self.store.holder)
            .field("namespace", &self.namespace)
            .field("key", &self.key)
            .finish()
    }
}

impl AdvisoryLock<'_> {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Release the lock now, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.delete_row()
    }

    fn delete_row(&self) -> Result<()> {
        self.store.conn.execute(
            "DELETE FROM advisory_locks WHERE namespace = ?1 AND key = ?2 AND holder = ?3",
            params![self.namespace, self.key, self.store.holder],
        )?;
        Ok(())
    }
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.delete_row() {
            log::warn!(
                "Failed to release advisory lock ({}, {}) held by {}: {}",
                self.namespace,
                self.key,
                self.store.holder,
                e
            );
        }
    }
}

impl RunStore {
    /// Try to take the advisory lock `(namespace, key)`.
    ///
    /// Returns `None` when another holder has it, including this session:
    /// locks are not reentrant.
    pub fn try_advisory_lock(&self, namespace: i64, key: i64) -> Result<Option<AdvisoryLock<'_>>> {
        let now = now_ms();
        let tx = self.write_tx()?;
        let expired = tx.execute(
            "DELETE FROM advisory_locks WHERE namespace = ?1 AND key = ?2 AND acquired_at < ?3",
            params![namespace, key, now - self.lock_lease_ms],
        )?;
        if expired > 0 {
            log::warn!("Took over expired advisory lock ({}, {})", namespace, key);
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO advisory_locks (namespace, key, holder, acquired_at) VALUES (?1, ?2, ?3, ?4)",
            params![namespace, key, self.holder, now],
        )?;
        tx.commit()?;

        if inserted == 1 {
            Ok(Some(AdvisoryLock {
                store: self,
                namespace,
                key,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}
