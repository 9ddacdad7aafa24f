//! Test fixtures: a manager wired to a simulated world, with automatic
//! directory cleanup and crash-style reopen.

use crate::world::{SimRegistry, SimWorld};
use revtx_core::{CallTable, Config, TxManager, TxStatus};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Opens a manager over the given directory and world, with a fail-fast
/// lock schedule suitable for tests.
pub fn open_manager(dir: &Path, world: &Arc<SimWorld>) -> TxManager {
    let config = Config::new(dir).lock_retries(Vec::new());
    let registry = Arc::new(SimRegistry::new(Arc::clone(world)));
    TxManager::open(config, registry).expect("open manager")
}

/// A manager plus its simulated world and temporary data directory.
pub struct TestRig {
    /// The manager under test.
    pub tm: TxManager,
    /// The simulated external world.
    pub world: Arc<SimWorld>,
    dir: TempDir,
}

impl TestRig {
    /// Creates a fresh rig on a new temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let world = Arc::new(SimWorld::default());
        let tm = open_manager(dir.path(), &world);
        Self { tm, world, dir }
    }

    /// Drops the manager without further finalization and constructs a new
    /// one on the same data directory - the crash-then-restart path. The
    /// simulated world survives, as the real external world would.
    pub fn reopen(self) -> Self {
        let Self { tm, world, dir } = self;
        drop(tm);
        let tm = open_manager(dir.path(), &world);
        Self { tm, world, dir }
    }

    /// The persisted status of a transaction.
    pub fn status(&self, tx_id: &str) -> TxStatus {
        self.tm
            .store()
            .get_tx_by_str_id(tx_id)
            .expect("load transaction")
            .expect("transaction exists")
            .status
    }

    /// The number of rows a transaction has in one call table.
    pub fn call_count(&self, tx_id: &str, table: CallTable) -> i64 {
        let ser_id = self
            .tm
            .store()
            .get_tx_by_str_id(tx_id)
            .expect("load transaction")
            .expect("transaction exists")
            .ser_id;
        self.tm
            .store()
            .count_calls(table, ser_id)
            .expect("count calls")
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}
