//! # RevTx Core
//!
//! A local transaction and undo/redo manager. RevTx wraps calls to
//! transactional side-effecting functions in a durable, recoverable
//! envelope:
//!
//! - every forward call is paired with an inverse program obtained from
//!   the function itself via a dry-run probe, and both are persisted;
//! - a running transaction can be rolled back on failure, a committed one
//!   undone, and an undone one redone;
//! - on startup the manager recovers any transaction a crash left in a
//!   non-terminal state.
//!
//! The host supplies a [`FuncRegistry`] resolving qualified function names
//! to callables; the manager persists state in a SQLite database under a
//! data directory and serializes cross-process access through an advisory
//! file lock.
//!
//! ```rust,ignore
//! use revtx_core::{Config, TxManager};
//!
//! let mut tm = TxManager::open(Config::new("/var/lib/myapp/tx"), registry)?;
//! tm.begin("deploy-42", Some("deploy config"), None);
//! tm.call(None, "kv.set", args, false);
//! tm.commit(None);
//! // later:
//! tm.undo(None);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod engine;
pub mod error;
pub mod func;
pub mod lock;
pub mod manager;
pub mod response;
pub mod status;
pub mod store;

pub use config::Config;
pub use error::{TxError, TxResult};
pub use func::{ArgMap, CallSpec, FuncCtx, FuncMeta, FuncRegistry, Registered, ResolveError,
    TxAction, TxFunc};
pub use lock::Locker;
pub use manager::TxManager;
pub use response::{code, Response};
pub use status::TxStatus;
pub use store::{CallRecord, CallTable, ListFilter, Store, TxRecord};
