//! The engine core: shared handles plus the per-backup retention locks.
//!
//! Everything the coordinator, retention engine, and scheduler need hangs
//! off one [`Engine`] constructed at startup and passed by reference; there
//! is no process-wide mutable state.

use crate::conductor::WorkflowEngine;
use crate::store::BackupStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-backup mutex table.
///
/// The retention lock is the invariant carrier for "freshest-always-safe":
/// it is held across the tail of create-completion (persist + tag) and the
/// entirety of a retention task, so a freshly created backup is always
/// tagged before it can be considered for election. Entries are created
/// lazily under a single top-level mutex.
#[derive(Default)]
pub struct RetentionLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RetentionLocks {
    /// Acquire the retention lock for a backup. The returned guard releases
    /// on drop, so error paths cannot leak the lock.
    pub async fn acquire(&self, backup_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock();
            Arc::clone(
                table
                    .entry(backup_name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// Shared engine state: the store, the workflow adapter, and the retention
/// lock table. Coordinator and retention behavior are implemented as
/// `impl Engine` blocks in their own modules.
pub struct Engine {
    store: Arc<BackupStore>,
    workflows: Arc<dyn WorkflowEngine>,
    locks: RetentionLocks,
}

impl Engine {
    pub fn new(store: Arc<BackupStore>, workflows: Arc<dyn WorkflowEngine>) -> Self {
        Self {
            store,
            workflows,
            locks: RetentionLocks::default(),
        }
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    pub(crate) fn workflows(&self) -> &dyn WorkflowEngine {
        self.workflows.as_ref()
    }

    pub(crate) fn locks(&self) -> &RetentionLocks {
        &self.locks
    }
}
