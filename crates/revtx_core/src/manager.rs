//! The transaction manager facade, request wrapper, recovery and cleanup.

use crate::config::Config;
use crate::engine::{LoopKind, LoopOpts};
use crate::error::{TxError, TxResult};
use crate::func::{ArgMap, CallSpec, FuncRegistry};
use crate::lock::Locker;
use crate::response::{code, Response};
use crate::status::TxStatus;
use crate::store::{CallTable, ListFilter, Store, TxRecord};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum accepted transaction id length.
const MAX_TX_ID_LEN: usize = 200;

/// Statuses `call` accepts normally, and while the manager is itself
/// executing a rollback (a callee may re-enter `call` mid-rollback).
const CALL_PERMITTED: &[TxStatus] = &[TxStatus::InProgress];
const CALL_PERMITTED_IN_ROLLBACK: &[TxStatus] = &[
    TxStatus::InProgress,
    TxStatus::Aborting,
    TxStatus::Undoing,
    TxStatus::Redoing,
    TxStatus::UndoAborting,
    TxStatus::RedoAborting,
];

/// Per-request scaffolding options for [`TxManager::wrap`].
struct WrapOpts<'a> {
    /// Explicit transaction id; falls back to the sticky default.
    tx_id: Option<&'a str>,
    /// Statuses the operation accepts; `None` skips the precondition.
    permitted: Option<&'a [TxStatus]>,
    /// Run quota cleanup before the body (only `begin` uses this).
    cleanup: bool,
}

/// The local transaction and undo/redo manager.
///
/// Wraps calls to transactional side-effecting functions in a durable,
/// recoverable envelope: each forward call is paired with an inverse
/// obtained from the function itself via a dry-run probe, and both
/// sequences are persisted so a running transaction can be rolled back, a
/// committed one undone, and an undone one redone.
///
/// Construction *is* the recovery path: [`TxManager::open`] drives every
/// transaction left in a non-terminal state by a prior crash to a terminal
/// state before returning, under an exclusive file lock.
///
/// Every facade operation returns a [`Response`] envelope; the manager
/// never panics or aborts on operational failures. The one fatal
/// constructor error is a too-old (or too-new) on-disk schema.
///
/// A manager is single-threaded: it is not safe for concurrent use from
/// multiple threads, and cross-process access is serialized through the
/// file lock.
pub struct TxManager {
    pub(crate) config: Config,
    pub(crate) store: Store,
    pub(crate) locker: Locker,
    pub(crate) registry: Arc<dyn FuncRegistry>,
    /// The transaction loaded by the current (or most recent) request.
    pub(crate) cur_tx: Option<TxRecord>,
    /// Sticky default transaction id for requests that omit one.
    pub(crate) sticky_tx_id: Option<String>,
    /// Re-entry guard: set while the manager executes a rollback.
    pub(crate) in_rollback: bool,
}

impl TxManager {
    /// Opens the manager, initializing the store and running crash
    /// recovery.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be initialized (including the fatal
    /// schema-version mismatch) or when the exclusive recovery lock cannot
    /// be acquired. Failures of individual per-transaction recoveries are
    /// logged and skipped.
    pub fn open(config: Config, registry: Arc<dyn FuncRegistry>) -> TxResult<Self> {
        let store = Store::open(&config.data_dir, config.create_if_missing)?;
        let locker = Locker::new(store.lock_path(), config.lock_retries.clone());
        let mut tm = Self {
            config,
            store,
            locker,
            registry,
            cur_tx: None,
            sticky_tx_id: None,
            in_rollback: false,
        };
        tm.recover()?;
        Ok(tm)
    }

    /// The transaction loaded by the most recent request, if any.
    #[must_use]
    pub fn current_tx(&self) -> Option<&TxRecord> {
        self.cur_tx.as_ref()
    }

    /// Direct access to the store, for tooling and tests.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Mutable access to the store, for tooling and tests.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    // --- Recovery and cleanup ---

    /// Acquires the exclusive lock and drives every non-terminal
    /// transaction to a terminal state.
    fn recover(&mut self) -> TxResult<()> {
        self.locker.acquire(false)?;
        let result = self.recover_pending();
        self.locker.release();
        result
    }

    fn recover_pending(&mut self) -> TxResult<()> {
        let pending = self.store.non_terminal_txs()?;
        for tx in pending {
            tracing::debug!(tx_id = %tx.str_id, status = %tx.status, "recovering transaction");
            self.cur_tx = Some(tx.clone());
            self.sticky_tx_id = Some(tx.str_id.clone());
            let resp = self.rollback_internal();
            if !resp.is_success() {
                tracing::warn!(
                    tx_id = %tx.str_id,
                    code = resp.code,
                    message = %resp.message,
                    "recovery rollback failed"
                );
            }
        }
        self.cur_tx = None;
        self.sticky_tx_id = None;
        Ok(())
    }

    /// Runs the rollback loop with the re-entry guard set on all paths.
    pub(crate) fn rollback_internal(&mut self) -> Response {
        let prev = std::mem::replace(&mut self.in_rollback, true);
        let resp = self.run_loop(LoopKind::Rollback, None, &LoopOpts::default());
        self.in_rollback = prev;
        resp
    }

    /// Purges terminal transactions beyond the configured quotas. Open
    /// transactions are never touched.
    pub fn cleanup(&mut self) -> TxResult<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        if let Some(age) = self.config.max_committed_age {
            let stale = self.store.list_txs(&ListFilter {
                statuses: Some(vec![TxStatus::Committed, TxStatus::Undone]),
                ..ListFilter::default()
            })?;
            let cutoff = now - age.as_secs_f64();
            for tx in stale {
                if tx.commit_time.is_some_and(|t| t < cutoff) {
                    self.purge(&tx)?;
                }
            }
        }
        if let Some(max) = self.config.max_committed_txs {
            let committed = self.store.list_txs(&ListFilter {
                statuses: Some(vec![TxStatus::Committed, TxStatus::Undone]),
                ..ListFilter::default()
            })?;
            let excess = committed.len().saturating_sub(max as usize);
            for tx in committed.into_iter().take(excess) {
                self.purge(&tx)?;
            }
        }
        if let Some(max) = self.config.max_txs {
            let all = self.store.list_txs(&ListFilter::default())?;
            let excess = all.len().saturating_sub(max as usize);
            let mut purged = 0;
            for tx in all {
                if purged >= excess {
                    break;
                }
                if tx.status.is_terminal() {
                    self.purge(&tx)?;
                    purged += 1;
                }
            }
        }
        Ok(())
    }

    fn purge(&mut self, tx: &TxRecord) -> TxResult<()> {
        tracing::debug!(tx_id = %tx.str_id, "purging transaction per cleanup quota");
        self.store.delete_tx(tx.ser_id)?;
        self.store.remove_work_dirs(tx.ser_id);
        Ok(())
    }

    // --- Request wrappers ---

    /// Per-request scaffolding: shared lock, SQL transaction, current-tx
    /// load, permitted-status precondition, commit-or-rollback, unlock on
    /// every exit path.
    fn wrap<F>(&mut self, opts: WrapOpts<'_>, body: F) -> Response
    where
        F: FnOnce(&mut Self) -> TxResult<Response>,
    {
        let lock_was_held = self.locker.is_held();
        if let Err(err) = self.locker.acquire(true) {
            return Response::new(code::ENV_FAILURE, err.to_string());
        }
        let resp = self.wrap_locked(opts, body);
        if !lock_was_held {
            self.locker.release();
        }
        resp
    }

    fn wrap_locked<F>(&mut self, opts: WrapOpts<'_>, body: F) -> Response
    where
        F: FnOnce(&mut Self) -> TxResult<Response>,
    {
        let tx_id = match opts.tx_id {
            Some(id) => id.to_string(),
            None => match &self.sticky_tx_id {
                Some(id) => id.clone(),
                None => return Response::new(code::BAD_REQUEST, "no transaction specified"),
            },
        };
        if tx_id.is_empty() || tx_id.len() > MAX_TX_ID_LEN {
            return Response::new(
                code::BAD_REQUEST,
                format!("transaction id must be 1..{MAX_TX_ID_LEN} characters"),
            );
        }
        if opts.cleanup {
            if let Err(err) = self.cleanup() {
                tracing::warn!(error = %err, "cleanup failed");
            }
        }
        if let Err(err) = self.store.begin_sqltx() {
            return Response::new(code::ENV_FAILURE, err.to_string());
        }
        self.cur_tx = match self.store.get_tx_by_str_id(&tx_id) {
            Ok(tx) => tx,
            Err(err) => {
                let _ = self.store.rollback_sqltx();
                return Response::new(code::ENV_FAILURE, err.to_string());
            }
        };
        self.sticky_tx_id = Some(tx_id.clone());
        if let Some(permitted) = opts.permitted {
            match &self.cur_tx {
                None => {
                    let _ = self.store.rollback_sqltx();
                    return Response::new(
                        code::NO_SUCH_TX,
                        format!("no such transaction: {tx_id}"),
                    );
                }
                Some(tx) if !permitted.contains(&tx.status) => {
                    let status = tx.status;
                    let _ = self.store.rollback_sqltx();
                    return Response::new(
                        code::BAD_STATUS,
                        format!(
                            "transaction {tx_id} has incompatible status '{status}' ({})",
                            status.describe()
                        ),
                    );
                }
                Some(_) => {}
            }
        }
        let resp = match body(self) {
            Ok(resp) => resp,
            Err(err) => Response::new(err.envelope_code(), err.to_string()),
        };
        if resp.is_success() || resp.skip_sqltx_rollback() {
            if let Err(err) = self.store.commit_sqltx() {
                let _ = self.store.rollback_sqltx();
                return Response::new(
                    code::ENV_FAILURE,
                    format!("commit of manager state failed: {err}"),
                );
            }
        } else {
            let _ = self.store.rollback_sqltx();
        }
        resp
    }

    /// Lighter wrapper for read-only or cross-transaction operations: lock
    /// only, no SQL transaction, no current-tx load.
    fn wrap_light<F>(&mut self, body: F) -> Response
    where
        F: FnOnce(&mut Self) -> TxResult<Response>,
    {
        let lock_was_held = self.locker.is_held();
        if let Err(err) = self.locker.acquire(true) {
            return Response::new(code::ENV_FAILURE, err.to_string());
        }
        let resp = match body(self) {
            Ok(resp) => resp,
            Err(err) => Response::new(err.envelope_code(), err.to_string()),
        };
        if !lock_was_held {
            self.locker.release();
        }
        resp
    }

    // --- Facade operations ---

    /// Begins a new transaction with the given unique id.
    ///
    /// Returns `409` when the id was ever used before. Runs quota cleanup
    /// first.
    pub fn begin(
        &mut self,
        tx_id: &str,
        summary: Option<&str>,
        client_token: Option<&str>,
    ) -> Response {
        let summary = summary.map(str::to_string);
        let owner = client_token.unwrap_or_default().to_string();
        self.wrap(
            WrapOpts {
                tx_id: Some(tx_id),
                permitted: None,
                cleanup: true,
            },
            |tm| {
                if let Some(existing) = &tm.cur_tx {
                    // The record belongs to someone else; leave the outer
                    // SQL transaction alone.
                    return Ok(Response::new(
                        code::DUPLICATE,
                        format!(
                            "transaction {} already exists (status '{}')",
                            existing.str_id, existing.status
                        ),
                    )
                    .without_sqltx_rollback());
                }
                let ctime = tm.store.now();
                let ser_id = tm.store.insert_tx(
                    tx_id,
                    &owner,
                    summary.as_deref(),
                    TxStatus::InProgress,
                    ctime,
                )?;
                tm.cur_tx = tm.store.get_tx_by_ser_id(ser_id)?;
                Ok(Response::ok())
            },
        )
    }

    /// Calls one transactional function within the transaction.
    pub fn call(&mut self, tx_id: Option<&str>, f: &str, args: ArgMap, dry_run: bool) -> Response {
        self.call_multi(tx_id, vec![CallSpec::new(f, args)], dry_run)
    }

    /// Calls a batch of transactional functions within the transaction.
    ///
    /// Permitted while the transaction is in progress - or in any
    /// non-terminal state when a callee re-enters during a rollback.
    pub fn call_multi(
        &mut self,
        tx_id: Option<&str>,
        calls: Vec<CallSpec>,
        dry_run: bool,
    ) -> Response {
        let permitted = if self.in_rollback {
            CALL_PERMITTED_IN_ROLLBACK
        } else {
            CALL_PERMITTED
        };
        let opts = LoopOpts {
            dry_run,
            sp: None,
        };
        self.wrap(
            WrapOpts {
                tx_id,
                permitted: Some(permitted),
                cleanup: false,
            },
            move |tm| Ok(tm.run_loop(LoopKind::Call, Some(calls), &opts)),
        )
    }

    /// Commits the transaction: drops its forward call log and marks it
    /// committed. A transaction stuck mid-abort is rolled back instead.
    pub fn commit(&mut self, tx_id: Option<&str>) -> Response {
        const PERMITTED: &[TxStatus] = &[TxStatus::InProgress, TxStatus::Aborting];
        self.wrap(
            WrapOpts {
                tx_id,
                permitted: Some(PERMITTED),
                cleanup: false,
            },
            |tm| {
                let Some(tx) = tm.cur_tx.clone() else {
                    return Err(TxError::call(code::INTERNAL, "current transaction not loaded"));
                };
                if tx.status == TxStatus::Aborting {
                    let resp = tm.rollback_internal();
                    return Ok(if resp.is_success() {
                        Response::new(code::OK, "Rolled back")
                    } else {
                        resp
                    });
                }
                tm.store.delete_calls(CallTable::Call, tx.ser_id)?;
                tm.store
                    .update_tx_status(tx.ser_id, TxStatus::Committed, true)?;
                let now = tm.store.now();
                tm.store.set_commit_time(tx.ser_id, now)?;
                Ok(Response::ok())
            },
        )
    }

    /// Rolls back the transaction.
    pub fn rollback(&mut self, tx_id: Option<&str>, sp: Option<&str>) -> Response {
        if sp.is_some() {
            return Response::new(
                code::NOT_IMPLEMENTED,
                "rollback to savepoint is not implemented",
            );
        }
        if self.in_rollback {
            return Response::new(code::OK, "Rollback already in progress");
        }
        const PERMITTED: &[TxStatus] = &[
            TxStatus::InProgress,
            TxStatus::Undoing,
            TxStatus::Redoing,
        ];
        self.wrap(
            WrapOpts {
                tx_id,
                permitted: Some(PERMITTED),
                cleanup: false,
            },
            |tm| Ok(tm.rollback_internal()),
        )
    }

    /// Undoes a committed transaction. With no id, targets the most
    /// recently committed one; `412` when there is none.
    pub fn undo(&mut self, tx_id: Option<&str>) -> Response {
        const PERMITTED: &[TxStatus] = &[TxStatus::Committed];
        let target = match tx_id {
            Some(id) => id.to_string(),
            None => match self.store.latest_committed() {
                Ok(Some(tx)) => tx.str_id,
                Ok(None) => {
                    return Response::new(code::PRECONDITION, "no committed transaction to undo");
                }
                Err(err) => return Response::new(code::ENV_FAILURE, err.to_string()),
            },
        };
        self.wrap(
            WrapOpts {
                tx_id: Some(&target),
                permitted: Some(PERMITTED),
                cleanup: false,
            },
            |tm| Ok(tm.run_loop(LoopKind::Undo, None, &LoopOpts::default())),
        )
    }

    /// Redoes an undone transaction. With no id, targets the earliest
    /// undone one; `412` when there is none.
    pub fn redo(&mut self, tx_id: Option<&str>) -> Response {
        const PERMITTED: &[TxStatus] = &[TxStatus::Undone];
        let target = match tx_id {
            Some(id) => id.to_string(),
            None => match self.store.earliest_undone() {
                Ok(Some(tx)) => tx.str_id,
                Ok(None) => {
                    return Response::new(code::PRECONDITION, "no undone transaction to redo");
                }
                Err(err) => return Response::new(code::ENV_FAILURE, err.to_string()),
            },
        };
        self.wrap(
            WrapOpts {
                tx_id: Some(&target),
                permitted: Some(PERMITTED),
                cleanup: false,
            },
            |tm| Ok(tm.run_loop(LoopKind::Redo, None, &LoopOpts::default())),
        )
    }

    /// Lists transactions ordered by creation. With `detail`, the payload
    /// carries full records; otherwise just string ids.
    pub fn list(&mut self, filter: &ListFilter, detail: bool) -> Response {
        let filter = filter.clone();
        self.wrap_light(move |tm| {
            let txs = tm.store.list_txs(&filter)?;
            let payload = if detail {
                Value::Array(txs.iter().map(TxRecord::to_value).collect())
            } else {
                Value::Array(
                    txs.iter()
                        .map(|tx| Value::String(tx.str_id.clone()))
                        .collect(),
                )
            };
            Ok(Response::ok().with_payload(payload))
        })
    }

    /// Discards a terminal transaction (committed, undone or
    /// inconsistent), removing its records and work directories.
    pub fn discard(&mut self, tx_id: Option<&str>) -> Response {
        self.wrap(
            WrapOpts {
                tx_id,
                permitted: Some(&TxStatus::DISCARDABLE),
                cleanup: false,
            },
            |tm| {
                let Some(tx) = tm.cur_tx.take() else {
                    return Err(TxError::call(code::INTERNAL, "current transaction not loaded"));
                };
                tm.store.delete_tx(tx.ser_id)?;
                tm.store.remove_work_dirs(tx.ser_id);
                tm.sticky_tx_id = None;
                Ok(Response::ok())
            },
        )
    }

    /// Discards every terminal transaction. The payload carries the count.
    pub fn discard_all(&mut self) -> Response {
        self.wrap_light(|tm| {
            let txs = tm.store.list_txs(&ListFilter {
                statuses: Some(TxStatus::DISCARDABLE.to_vec()),
                ..ListFilter::default()
            })?;
            let count = txs.len();
            for tx in txs {
                tm.store.delete_tx(tx.ser_id)?;
                tm.store.remove_work_dirs(tx.ser_id);
                if tm.cur_tx.as_ref().is_some_and(|cur| cur.ser_id == tx.ser_id) {
                    tm.cur_tx = None;
                    tm.sticky_tx_id = None;
                }
            }
            Ok(Response::ok().with_payload(Value::from(count)))
        })
    }

    /// Lazily creates and returns the current transaction's trash
    /// directory; `412` when no transaction is current.
    pub fn get_trash_dir(&mut self) -> Response {
        let Some(tx) = &self.cur_tx else {
            return Response::new(code::PRECONDITION, "no current transaction");
        };
        match self.store.trash_dir(tx.ser_id) {
            Ok(path) => Response::ok().with_payload(Value::String(path.display().to_string())),
            Err(err) => Response::new(err.envelope_code(), err.to_string()),
        }
    }

    /// Lazily creates and returns the current transaction's tmp directory;
    /// `412` when no transaction is current.
    pub fn get_tmp_dir(&mut self) -> Response {
        let Some(tx) = &self.cur_tx else {
            return Response::new(code::PRECONDITION, "no current transaction");
        };
        match self.store.tmp_dir(tx.ser_id) {
            Ok(path) => Response::ok().with_payload(Value::String(path.display().to_string())),
            Err(err) => Response::new(err.envelope_code(), err.to_string()),
        }
    }

    /// Not implemented.
    pub fn prepare(&mut self) -> Response {
        Response::new(code::NOT_IMPLEMENTED, "prepare is not implemented")
    }

    /// Not implemented.
    pub fn savepoint(&mut self, _sp: &str) -> Response {
        Response::new(code::NOT_IMPLEMENTED, "savepoint is not implemented")
    }

    /// Not implemented.
    pub fn release_savepoint(&mut self, _sp: &str) -> Response {
        Response::new(
            code::NOT_IMPLEMENTED,
            "release_savepoint is not implemented",
        )
    }
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager")
            .field("data_dir", &self.config.data_dir)
            .field("cur_tx", &self.cur_tx.as_ref().map(|tx| &tx.str_id))
            .field("in_rollback", &self.in_rollback)
            .finish_non_exhaustive()
    }
}
