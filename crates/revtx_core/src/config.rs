//! Manager configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Linear-backoff schedule for lock acquisition: 1s, 2s, .. 5s (15s total).
pub const DEFAULT_LOCK_RETRIES: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(4),
    Duration::from_secs(5),
];

/// Configuration for opening a [`crate::manager::TxManager`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding `tx.db`, the lock sidecar and the per-Rtx
    /// `.trash`/`.tmp` subdirectories.
    pub data_dir: PathBuf,

    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Sleep durations between non-blocking lock attempts. An empty
    /// schedule means a single attempt.
    pub lock_retries: Vec<Duration>,

    /// Maximum total number of recorded transactions; cleanup purges the
    /// oldest terminal records beyond this. `None` = unlimited.
    pub max_txs: Option<u64>,

    /// Maximum number of committed/undone transactions kept for undo/redo.
    pub max_committed_txs: Option<u64>,

    /// Maximum age of committed/undone transactions; older ones are
    /// purged by cleanup.
    pub max_committed_age: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
        Self::new(home.join(".revtx"))
    }
}

impl Config {
    /// Creates a configuration for the given data directory with default
    /// values (create if missing, 15s lock schedule, no quotas).
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            create_if_missing: true,
            lock_retries: DEFAULT_LOCK_RETRIES.to_vec(),
            max_txs: None,
            max_committed_txs: None,
            max_committed_age: None,
        }
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the lock retry schedule.
    #[must_use]
    pub fn lock_retries(mut self, schedule: Vec<Duration>) -> Self {
        self.lock_retries = schedule;
        self
    }

    /// Sets the total transaction quota.
    #[must_use]
    pub fn max_txs(mut self, value: u64) -> Self {
        self.max_txs = Some(value);
        self
    }

    /// Sets the committed/undone transaction quota.
    #[must_use]
    pub fn max_committed_txs(mut self, value: u64) -> Self {
        self.max_committed_txs = Some(value);
        self
    }

    /// Sets the committed/undone transaction age limit.
    #[must_use]
    pub fn max_committed_age(mut self, value: Duration) -> Self {
        self.max_committed_age = Some(value);
        self
    }
}
