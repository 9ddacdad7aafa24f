//! Advisory file locking for cross-process serialization.
//!
//! The lock lives on a sidecar path (`tx.db.lck`), never on the database
//! file itself, to avoid colliding with SQLite's own OS-level locks.
//! Routine operations take a shared lock; recovery takes an exclusive one.
//! Attempts are non-blocking with a linear-backoff retry schedule.

use crate::error::{TxError, TxResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Advisory lock on a sidecar file, shared or exclusive.
///
/// The lock is held from a successful [`Locker::acquire`] until
/// [`Locker::release`] (or drop). Acquiring while already held is a no-op,
/// which lets an operation re-enter the manager without deadlocking on its
/// own lock.
#[derive(Debug)]
pub struct Locker {
    path: PathBuf,
    retries: Vec<Duration>,
    held: Option<File>,
}

impl Locker {
    /// Creates a locker for the given sidecar path.
    pub fn new(path: impl AsRef<Path>, retries: Vec<Duration>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            retries,
            held: None,
        }
    }

    /// Acquires the lock, shared or exclusive.
    ///
    /// Tries a non-blocking attempt, then sleeps through the retry
    /// schedule. On exhaustion returns a lock-timeout error hinting that a
    /// recovery is probably in progress elsewhere.
    pub fn acquire(&mut self, shared: bool) -> TxResult<()> {
        if self.held.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let mut attempt = 0;
        loop {
            let locked = if shared {
                FileExt::try_lock_shared(&file)
            } else {
                FileExt::try_lock_exclusive(&file)
            };
            match locked {
                Ok(()) => {
                    self.held = Some(file);
                    return Ok(());
                }
                Err(_) if attempt < self.retries.len() => {
                    std::thread::sleep(self.retries[attempt]);
                    attempt += 1;
                }
                Err(_) => {
                    return Err(TxError::lock_timeout(
                        self.path.display().to_string(),
                        "another instance holds the lock (recovery probably in progress)",
                    ));
                }
            }
        }
    }

    /// Releases the lock if held.
    pub fn release(&mut self) {
        if let Some(file) = self.held.take() {
            let _ = FileExt::unlock(&file);
        }
    }

    /// Whether the lock is currently held by this locker.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.release();
    }
}
