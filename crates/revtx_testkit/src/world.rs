//! A simulated external world and function registry.
//!
//! [`SimWorld`] is an in-memory key/value store standing in for the real
//! side-effecting environment (think environment variables). The registry
//! resolves a small family of `kv.*` functions that implement the
//! manager's function contract - dry-run probes that report `undo_data`
//! without side effects, `304` when there is nothing to do - plus a few
//! deliberately misbehaving variants for failure-path tests.

use revtx_core::response::code;
use revtx_core::{
    ArgMap, FuncCtx, FuncMeta, FuncRegistry, Registered, ResolveError, Response, TxAction, TxFunc,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// An in-memory key/value "external world".
#[derive(Debug, Default)]
pub struct SimWorld {
    vars: Mutex<BTreeMap<String, String>>,
}

impl SimWorld {
    /// Reads a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.lock().expect("world lock").get(key).cloned()
    }

    /// Writes a key.
    pub fn set(&self, key: &str, val: &str) {
        self.vars
            .lock()
            .expect("world lock")
            .insert(key.to_string(), val.to_string());
    }

    /// Removes a key.
    pub fn del(&self, key: &str) {
        self.vars.lock().expect("world lock").remove(key);
    }

    /// A copy of the full state, for assertions.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars.lock().expect("world lock").clone()
    }
}

/// Builds the `{key, val}` argument map the `kv.*` functions take.
pub fn kv_args(key: &str, val: &str) -> ArgMap {
    let mut args = ArgMap::new();
    args.insert("key".into(), json!(key));
    args.insert("val".into(), json!(val));
    args
}

fn key_arg(args: &ArgMap) -> Result<&str, Response> {
    args.get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| Response::new(code::BAD_REQUEST, "missing 'key' argument"))
}

/// The inverse program restoring `key` to `old`.
fn restore_undo_data(key: &str, old: Option<&str>) -> Value {
    match old {
        Some(prev) => json!([["kv.set", {"key": key, "val": prev}]]),
        None => json!([["kv.del", {"key": key}]]),
    }
}

/// `kv.set` - sets a key, undoable by restoring the previous value.
struct KvSet {
    world: Arc<SimWorld>,
}

impl TxFunc for KvSet {
    fn call(&self, ctx: &mut FuncCtx<'_>, args: &ArgMap) -> Response {
        let key = match key_arg(args) {
            Ok(key) => key,
            Err(resp) => return resp,
        };
        let val = args.get("val").and_then(Value::as_str).unwrap_or("");
        let old = self.world.get(key);
        if old.as_deref() == Some(val) {
            return Response::no_change("value already set");
        }
        if ctx.dry_run {
            return Response::ok().with_undo_data(restore_undo_data(key, old.as_deref()));
        }
        self.world.set(key, val);
        Response::ok()
    }
}

/// `kv.del` - removes a key, undoable by restoring the previous value.
struct KvDel {
    world: Arc<SimWorld>,
}

impl TxFunc for KvDel {
    fn call(&self, ctx: &mut FuncCtx<'_>, args: &ArgMap) -> Response {
        let key = match key_arg(args) {
            Ok(key) => key,
            Err(resp) => return resp,
        };
        let Some(old) = self.world.get(key) else {
            return Response::no_change("key not present");
        };
        if ctx.dry_run {
            return Response::ok().with_undo_data(json!([["kv.set", {"key": key, "val": old}]]));
        }
        self.world.del(key);
        Response::ok()
    }
}

/// `kv.fail` - probes like `kv.set` but fails its real call. Exercises
/// the manager's automatic rollback.
struct KvFail {
    world: Arc<SimWorld>,
}

impl TxFunc for KvFail {
    fn call(&self, ctx: &mut FuncCtx<'_>, args: &ArgMap) -> Response {
        let key = match key_arg(args) {
            Ok(key) => key,
            Err(resp) => return resp,
        };
        if ctx.dry_run {
            let old = self.world.get(key);
            return Response::ok().with_undo_data(restore_undo_data(key, old.as_deref()));
        }
        Response::new(code::INTERNAL, "simulated failure")
    }
}

/// `kv.set_reenter_undo` - sets a key like `kv.set`, but records its
/// inverse as a `kv.reenter` call, exercising manager re-entry during
/// rollback.
struct KvSetReenterUndo {
    world: Arc<SimWorld>,
}

impl TxFunc for KvSetReenterUndo {
    fn call(&self, ctx: &mut FuncCtx<'_>, args: &ArgMap) -> Response {
        let key = match key_arg(args) {
            Ok(key) => key,
            Err(resp) => return resp,
        };
        let val = args.get("val").and_then(Value::as_str).unwrap_or("");
        let old = self.world.get(key);
        if old.as_deref() == Some(val) {
            return Response::no_change("value already set");
        }
        if ctx.dry_run {
            let undo = match old {
                Some(prev) => json!([["kv.reenter", {"key": key, "val": prev}]]),
                None => json!([["kv.reenter", {"key": key}]]),
            };
            return Response::ok().with_undo_data(undo);
        }
        self.world.set(key, val);
        Response::ok()
    }
}

/// `kv.reenter` - restores a key by re-entering the manager's `call`
/// facade, the way an undo handler may during a rollback. Also verifies
/// that a nested rollback request is ignored while one is in progress.
struct KvReenter;

impl TxFunc for KvReenter {
    fn call(&self, ctx: &mut FuncCtx<'_>, args: &ArgMap) -> Response {
        if ctx.dry_run {
            return Response::ok();
        }
        if ctx.action == TxAction::Rollback {
            let nested = ctx.tm.rollback(None, None);
            if nested.code != code::OK {
                return Response::new(code::INTERNAL, "nested rollback was not ignored");
            }
        }
        let (inner_f, inner_args) = if args.contains_key("val") {
            ("kv.set", args.clone())
        } else {
            ("kv.del", args.clone())
        };
        let resp = ctx.tm.call(None, inner_f, inner_args, false);
        if resp.is_success() {
            Response::ok()
        } else {
            Response::new(
                resp.code,
                format!("re-entrant call failed: {}", resp.message),
            )
        }
    }
}

/// Registry resolving the `kv.*` test functions against one [`SimWorld`].
///
/// `kv.nodry` resolves to a working function whose metadata lacks the
/// dry-run capability, for precondition tests.
pub struct SimRegistry {
    world: Arc<SimWorld>,
}

impl SimRegistry {
    /// Creates a registry over the given world.
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self { world }
    }
}

impl FuncRegistry for SimRegistry {
    fn resolve(&self, name: &str) -> Result<Registered, ResolveError> {
        let world = Arc::clone(&self.world);
        match name {
            "kv.set" => Ok(Registered {
                func: Arc::new(KvSet { world }),
                meta: FuncMeta::full(),
            }),
            "kv.del" => Ok(Registered {
                func: Arc::new(KvDel { world }),
                meta: FuncMeta::full(),
            }),
            "kv.fail" => Ok(Registered {
                func: Arc::new(KvFail { world }),
                meta: FuncMeta::full(),
            }),
            "kv.set_reenter_undo" => Ok(Registered {
                func: Arc::new(KvSetReenterUndo { world }),
                meta: FuncMeta::full(),
            }),
            "kv.reenter" => Ok(Registered {
                func: Arc::new(KvReenter),
                meta: FuncMeta::full(),
            }),
            "kv.nodry" => Ok(Registered {
                func: Arc::new(KvSet { world }),
                meta: FuncMeta {
                    transactional: true,
                    undoable: true,
                    dry_run: false,
                },
            }),
            other => Err(ResolveError::NotFound(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_ctx<'a>(tm: &'a mut revtx_core::TxManager) -> FuncCtx<'a> {
        FuncCtx {
            tm,
            action: TxAction::Forward,
            dry_run: true,
            check_state: true,
        }
    }

    #[test]
    fn world_snapshot_reflects_mutations() {
        let world = SimWorld::default();
        world.set("A", "1");
        world.set("B", "2");
        world.del("A");
        let snap = world.snapshot();
        assert_eq!(snap.get("B").map(String::as_str), Some("2"));
        assert!(!snap.contains_key("A"));
    }

    #[test]
    fn dry_run_probe_reports_inverse_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(SimWorld::default());
        let mut tm = crate::fixtures::open_manager(dir.path(), &world);
        let registry = SimRegistry::new(Arc::clone(&world));

        let set = registry.resolve("kv.set").unwrap();
        let resp = set.func.call(&mut probe_ctx(&mut tm), &kv_args("A", "1"));
        assert_eq!(resp.code, 200);
        assert_eq!(
            resp.undo_data().unwrap(),
            &json!([["kv.del", {"key": "A"}]])
        );
        assert!(world.get("A").is_none());

        world.set("A", "0");
        let resp = set.func.call(&mut probe_ctx(&mut tm), &kv_args("A", "1"));
        assert_eq!(
            resp.undo_data().unwrap(),
            &json!([["kv.set", {"key": "A", "val": "0"}]])
        );
        assert_eq!(world.get("A").as_deref(), Some("0"));
    }

    #[test]
    fn already_set_value_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(SimWorld::default());
        let mut tm = crate::fixtures::open_manager(dir.path(), &world);
        world.set("A", "1");
        let registry = SimRegistry::new(Arc::clone(&world));
        let set = registry.resolve("kv.set").unwrap();
        let resp = set.func.call(&mut probe_ctx(&mut tm), &kv_args("A", "1"));
        assert_eq!(resp.code, 304);
        assert!(resp.undo_data().is_none());
    }

    #[test]
    fn unknown_function_is_not_found() {
        let world = Arc::new(SimWorld::default());
        let registry = SimRegistry::new(world);
        assert!(matches!(
            registry.resolve("kv.ghost"),
            Err(ResolveError::NotFound(_))
        ));
    }
}
