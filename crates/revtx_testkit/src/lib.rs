//! # RevTx Testkit
//!
//! Test utilities for RevTx:
//!
//! - A simulated external world and `kv.*` function registry implementing
//!   the manager's function contract (dry-run probes, `undo_data`,
//!   deliberate failure modes).
//! - Manager fixtures with temporary data directories and crash-style
//!   reopen.
//! - End-to-end lifecycle, failure-protocol and crash-recovery scenarios
//!   driving the public facade.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
#[cfg(test)]
mod scenarios;
pub mod world;

pub use fixtures::{open_manager, TestRig};
pub use world::{kv_args, SimRegistry, SimWorld};
