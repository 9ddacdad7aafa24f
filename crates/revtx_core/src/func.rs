//! The contract between the manager and transactional functions.
//!
//! A function registry resolves a qualified name to a callable plus
//! metadata advertising its capabilities. The manager only drives
//! functions that are transactional, undoable and dry-run capable.
//!
//! Caller-supplied arguments travel as a plain JSON map ([`ArgMap`]); the
//! manager's reserved channel to the callee is the typed [`FuncCtx`]
//! struct. `-`-prefixed keys are reserved at the storage boundary: any
//! caller key beginning with `-` is stripped before an argument map is
//! recorded or passed on.

use crate::error::{TxError, TxResult};
use crate::manager::TxManager;
use crate::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// A caller-supplied argument mapping.
pub type ArgMap = Map<String, Value>;

/// Capability metadata a registry advertises for a function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncMeta {
    /// The function participates in transactions.
    pub transactional: bool,
    /// The function can be undone.
    pub undoable: bool,
    /// The function supports dry-run probing.
    pub dry_run: bool,
}

impl FuncMeta {
    /// Metadata with all three capabilities.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            transactional: true,
            undoable: true,
            dry_run: true,
        }
    }

    /// Whether the function can be driven by the manager: all three
    /// capabilities are required.
    #[must_use]
    pub const fn supports_tx(self) -> bool {
        self.transactional && self.undoable && self.dry_run
    }
}

/// Whether the manager is calling forward or as part of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// Normal forward execution.
    Forward,
    /// The manager is rolling back; the callee may adjust behavior and may
    /// re-enter [`TxManager::call`] through the context.
    Rollback,
}

/// The manager's reserved channel to a callee.
///
/// Carries the back-reference to the manager (so a callee can request
/// trash/tmp directories or re-enter `call` during a rollback) and the
/// invocation mode flags. The undo direction is always "do": the manager
/// undoes work by running the recorded inverse program forward, so callees
/// are never asked to invert themselves in place.
pub struct FuncCtx<'a> {
    /// Back-reference to the driving manager.
    pub tm: &'a mut TxManager,
    /// Forward call or rollback.
    pub action: TxAction,
    /// When set, the callee must not cause side effects.
    pub dry_run: bool,
    /// When set together with `dry_run`, the callee must inspect current
    /// state and return `undo_data` in the response extra.
    pub check_state: bool,
}

/// A transactional side-effecting function.
pub trait TxFunc: Send + Sync {
    /// Invokes the function.
    ///
    /// Success is `200`, or `304` when there was nothing to do. On a
    /// dry-run probe with `check_state`, the response's `undo_data` extra
    /// carries the list of `[name, args]` inverse calls.
    fn call(&self, ctx: &mut FuncCtx<'_>, args: &ArgMap) -> Response;
}

/// A resolved function: the callable plus its capability metadata.
#[derive(Clone)]
pub struct Registered {
    /// The callable.
    pub func: Arc<dyn TxFunc>,
    /// Advertised capabilities.
    pub meta: FuncMeta,
}

/// Errors a registry can produce while resolving a name.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The name does not map to a known function.
    #[error("no such function: {0}")]
    NotFound(String),
    /// The function exists but could not be loaded.
    #[error("failed to load {name}: {message}")]
    LoadFailed {
        /// The name being resolved.
        name: String,
        /// Description of the failure.
        message: String,
    },
}

/// Resolves qualified function names to callables. Consumed by the
/// manager, owned by the host.
pub trait FuncRegistry: Send + Sync {
    /// Resolves a (syntactically valid) qualified name.
    fn resolve(&self, name: &str) -> Result<Registered, ResolveError>;
}

/// One forward call to make: a qualified name plus caller arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    /// Qualified function name.
    pub f: String,
    /// Caller arguments.
    pub args: ArgMap,
}

impl CallSpec {
    /// Creates a call spec.
    pub fn new(f: impl Into<String>, args: ArgMap) -> Self {
        Self { f: f.into(), args }
    }
}

/// Whether a qualified function name is well formed: one or more
/// identifier segments joined by `.`, at most 255 characters.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Strips reserved (`-`-prefixed) keys from a caller argument map.
#[must_use]
pub(crate) fn strip_reserved(args: &ArgMap) -> ArgMap {
    args.iter()
        .filter(|(k, _)| !k.starts_with('-'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Extracts the `undo_data` list from a dry-run probe response.
///
/// Each entry is a `[name, args]` pair. A missing extra means the function
/// has nothing to undo. A malformed extra is an implementation bug in the
/// callee and surfaces as `500`.
pub(crate) fn parse_undo_data(probe: &Response) -> TxResult<Vec<(String, ArgMap)>> {
    let Some(raw) = probe.undo_data() else {
        return Ok(Vec::new());
    };
    let entries = raw
        .as_array()
        .ok_or_else(|| TxError::call(500, "undo_data must be a list"))?;
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry
            .as_array()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TxError::call(500, "undo_data entry must be a [name, args] pair"))?;
        let name = pair[0]
            .as_str()
            .ok_or_else(|| TxError::call(500, "undo_data entry name must be a string"))?
            .to_string();
        let args = match pair.get(1) {
            None | Some(Value::Null) => ArgMap::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(TxError::call(500, "undo_data entry args must be a map"));
            }
        };
        parsed.push((name, args));
    }
    Ok(parsed)
}

/// Renders parsed undo data back to its list-of-pairs JSON form.
#[must_use]
pub(crate) fn undo_data_to_value(undo_data: &[(String, ArgMap)]) -> Value {
    Value::Array(
        undo_data
            .iter()
            .map(|(name, args)| {
                Value::Array(vec![
                    Value::String(name.clone()),
                    Value::Object(args.clone()),
                ])
            })
            .collect(),
    )
}
