//! The unified call-looping engine.
//!
//! One loop serves `call`, `rollback`, `undo` and `redo`: the operation
//! selects a source table (or the caller-supplied list) and a sink table,
//! and the loop executes entries in `(ctime, id)` order - reversed for the
//! table-sourced operations - probing each function with a dry run to
//! collect its inverse program before the real call.
//!
//! Two invariants drive the phase order:
//!
//! - The transient status is written (and the resume marker cleared) in a
//!   standalone autocommitted statement *before* any call executes, so a
//!   crash at any later point leaves a state recovery can complete.
//! - Undo rows are recorded *before* the real call, so a crash in between
//!   leaves a recorded inverse for a call that never happened - which the
//!   callee's state-checking undo handler treats as a no-op.

use crate::error::{TxError, TxResult};
use crate::func::{
    parse_undo_data, strip_reserved, undo_data_to_value, valid_name, ArgMap, CallSpec, FuncCtx,
    TxAction,
};
use crate::manager::TxManager;
use crate::response::{code, Response};
use crate::status::{redo_route, rollback_route, undo_route, TxStatus};
use crate::store::{CallTable, TxRecord};
use std::sync::Arc;

/// The operation a loop run serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopKind {
    Call,
    Rollback,
    Undo,
    Redo,
}

/// Options for one loop run.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoopOpts {
    /// Probe only: report undo data, record nothing, cause no effects.
    pub dry_run: bool,
    /// Reserved savepoint label.
    pub sp: Option<String>,
}

/// One unit of work: the persisted row id when sourced from a table, plus
/// the function name and caller arguments.
struct LoopEntry {
    id: Option<i64>,
    f: String,
    args: ArgMap,
}

impl TxManager {
    /// Runs the loop for the current transaction, turning any failure into
    /// the annotated error envelope of the failure protocol.
    pub(crate) fn run_loop(
        &mut self,
        kind: LoopKind,
        supplied: Option<Vec<CallSpec>>,
        opts: &LoopOpts,
    ) -> Response {
        let Some(tx) = self.cur_tx.clone() else {
            return Response::new(
                code::INTERNAL,
                "call loop invoked without a current transaction",
            );
        };
        match self.loop_inner(kind, tx.clone(), supplied, opts) {
            Ok(resp) => resp,
            Err(err) => self.loop_failure(&tx, err),
        }
    }

    fn loop_inner(
        &mut self,
        kind: LoopKind,
        mut tx: TxRecord,
        supplied: Option<Vec<CallSpec>>,
        opts: &LoopOpts,
    ) -> TxResult<Response> {
        // Phase A: leave the wrapper's SQL transaction. From here to the
        // end of the loop every statement autocommits, so other instances
        // observe the transient status immediately and refuse to
        // interfere.
        self.store.commit_sqltx()?;

        let route = match kind {
            LoopKind::Call => None,
            LoopKind::Rollback => match rollback_route(tx.status) {
                Some(route) => Some(route),
                None => {
                    return Ok(Response::no_change(format!(
                        "transaction {} is already {}",
                        tx.str_id,
                        tx.status.describe()
                    )));
                }
            },
            LoopKind::Undo => Some(undo_route(tx.status).ok_or_else(|| {
                TxError::call(
                    code::ENV_FAILURE,
                    format!("cannot undo a transaction that is {}", tx.status.describe()),
                )
            })?),
            LoopKind::Redo => Some(redo_route(tx.status).ok_or_else(|| {
                TxError::call(
                    code::ENV_FAILURE,
                    format!("cannot redo a transaction that is {}", tx.status.describe()),
                )
            })?),
        };

        if let Some((transient, _)) = route {
            if transient != tx.status {
                self.store.update_tx_status(tx.ser_id, transient, true)?;
                let reread = self.store.get_tx_by_ser_id(tx.ser_id)?.ok_or_else(|| {
                    TxError::call(code::ENV_FAILURE, "transaction disappeared mid-operation")
                })?;
                if reread.status != transient {
                    return Err(TxError::call(
                        code::ENV_FAILURE,
                        format!("status update to '{transient}' was not applied"),
                    ));
                }
                tx.status = transient;
                tx.last_call_id = None;
            }
        }

        // Phase B: source and sink tables. A rollback reads the table its
        // interrupted operation was writing (or had written) and records
        // nothing new.
        let source = match kind {
            LoopKind::Call => None,
            LoopKind::Undo => Some(CallTable::UndoCall),
            LoopKind::Redo => Some(CallTable::Call),
            LoopKind::Rollback => Some(match tx.status {
                TxStatus::Aborting | TxStatus::RedoAborting => CallTable::UndoCall,
                TxStatus::UndoAborting => CallTable::Call,
                other => {
                    return Err(TxError::call(
                        code::ENV_FAILURE,
                        format!("rollback from unexpected status '{other}'"),
                    ));
                }
            }),
        };
        let sink = match kind {
            LoopKind::Call | LoopKind::Redo => Some(CallTable::UndoCall),
            LoopKind::Undo => Some(CallTable::Call),
            LoopKind::Rollback => None,
        };
        let reversed = source.is_some();

        // Phase C: the work list, resume-filtered and ordered.
        let entries: Vec<LoopEntry> = match source {
            Some(table) => self
                .store
                .select_calls(table, tx.ser_id, reversed, tx.last_call_id)?
                .into_iter()
                .map(|c| LoopEntry {
                    id: Some(c.id),
                    f: c.f,
                    args: c.args,
                })
                .collect(),
            None => supplied
                .unwrap_or_default()
                .into_iter()
                .map(|c| LoopEntry {
                    id: None,
                    f: c.f,
                    args: c.args,
                })
                .collect(),
        };

        // Recording is skipped for the whole of a rollback, including a
        // re-entrant `call` a callee issues mid-rollback.
        let recording = sink.is_some() && !self.in_rollback;
        let action = if self.in_rollback {
            TxAction::Rollback
        } else {
            TxAction::Forward
        };
        let registry = Arc::clone(&self.registry);
        let sp_label = opts.sp.as_deref();

        // Phase D: per-call execution.
        for entry in entries {
            if !valid_name(&entry.f) {
                return Err(TxError::call(
                    code::BAD_REQUEST,
                    format!("invalid function name '{}'", entry.f),
                ));
            }
            let reg = registry
                .resolve(&entry.f)
                .map_err(|err| TxError::call(code::INTERNAL, err.to_string()))?;
            if !reg.meta.supports_tx() {
                return Err(TxError::call(
                    code::PRECONDITION,
                    format!(
                        "function {} does not support transactional operation \
                         (transactional, undoable and dry-run capabilities are required)",
                        entry.f
                    ),
                ));
            }
            let caller_args = strip_reserved(&entry.args);

            // Dry-run probe: collect this call's inverse program.
            let mut undo_data = Vec::new();
            if recording {
                let probe = {
                    let mut ctx = FuncCtx {
                        tm: &mut *self,
                        action,
                        dry_run: true,
                        check_state: true,
                    };
                    reg.func.call(&mut ctx, &caller_args)
                };
                if !probe.is_success() {
                    return Err(TxError::call(
                        code::ENV_FAILURE,
                        format!(
                            "dry run of {} failed: {} - {}",
                            entry.f, probe.code, probe.message
                        ),
                    ));
                }
                undo_data = parse_undo_data(&probe)?;
                for (undo_f, _) in &undo_data {
                    if !valid_name(undo_f) {
                        return Err(TxError::call(
                            code::BAD_REQUEST,
                            format!("invalid undo function name '{undo_f}'"),
                        ));
                    }
                    let undo_reg = registry
                        .resolve(undo_f)
                        .map_err(|err| TxError::call(code::INTERNAL, err.to_string()))?;
                    if !undo_reg.meta.transactional {
                        return Err(TxError::call(
                            code::PRECONDITION,
                            format!("undo function {undo_f} is not transactional"),
                        ));
                    }
                }
                if opts.dry_run {
                    let payload = undo_data_to_value(&undo_data);
                    return Ok(if undo_data.is_empty() {
                        Response::no_change("Nothing to do").with_payload(payload)
                    } else {
                        Response::ok().with_payload(payload)
                    });
                }
            }

            // Record before the real call: the forward row (for `call`),
            // then one sink row per undo entry.
            let mut marker_id = entry.id;
            if recording {
                if kind == LoopKind::Call {
                    let ctime = self.store.now();
                    marker_id = Some(self.store.insert_call(
                        CallTable::Call,
                        tx.ser_id,
                        None,
                        ctime,
                        &entry.f,
                        &caller_args,
                    )?);
                }
                if let Some(sink_table) = sink {
                    for (i, (undo_f, undo_args)) in undo_data.iter().enumerate() {
                        let sp = if i == 0 { sp_label } else { None };
                        let ctime = self.store.now();
                        self.store
                            .insert_call(sink_table, tx.ser_id, sp, ctime, undo_f, undo_args)?;
                    }
                }
            }

            // The real call.
            let real = {
                let mut ctx = FuncCtx {
                    tm: &mut *self,
                    action,
                    dry_run: false,
                    check_state: false,
                };
                reg.func.call(&mut ctx, &caller_args)
            };
            if !real.is_success() {
                return Err(TxError::call(
                    code::ENV_FAILURE,
                    format!(
                        "function {} failed: {} - {}",
                        entry.f, real.code, real.message
                    ),
                ));
            }

            // Resume marker, deliberately in its own statement: a crash
            // after the call but before this update re-executes one
            // idempotent step during recovery.
            if let Some(id) = marker_id {
                self.store.set_last_call_id(tx.ser_id, id)?;
            }
        }

        // Phase E: drop the now-stale direction, then write the final
        // status.
        match kind {
            LoopKind::Undo => {
                self.store.delete_calls(CallTable::UndoCall, tx.ser_id)?;
            }
            LoopKind::Redo => {
                self.store.delete_calls(CallTable::Call, tx.ser_id)?;
            }
            LoopKind::Rollback => {
                if let Some(table) = source {
                    self.store.delete_calls(table, tx.ser_id)?;
                }
                if matches!(route, Some((_, TxStatus::RolledBack))) {
                    self.store.delete_calls(CallTable::Call, tx.ser_id)?;
                }
            }
            LoopKind::Call => {}
        }
        if let Some((_, final_status)) = route {
            self.store.update_tx_status(tx.ser_id, final_status, true)?;
        }

        Ok(match kind {
            LoopKind::Rollback => Response::new(code::OK, "Rolled back"),
            _ => Response::ok(),
        })
    }

    /// The failure protocol: a failing rollback marks the transaction
    /// inconsistent and abandons it; any other failing operation is rolled
    /// back internally and the error annotated with the outcome. The
    /// wrapper is told to skip SQL-tx rollback - the loop already handled
    /// its own state.
    fn loop_failure(&mut self, tx: &TxRecord, err: TxError) -> Response {
        let status_code = err.envelope_code();
        let message = err.to_string();
        if self.in_rollback {
            if let Err(mark_err) =
                self.store
                    .update_tx_status(tx.ser_id, TxStatus::Inconsistent, true)
            {
                tracing::warn!(
                    tx_id = %tx.str_id,
                    error = %mark_err,
                    "failed to mark transaction inconsistent"
                );
            }
            return Response::new(status_code, message).without_sqltx_rollback();
        }
        // Refresh the record so the rollback routes from the transient
        // status the failed operation wrote, not the pre-operation one.
        if let Ok(Some(fresh)) = self.store.get_tx_by_ser_id(tx.ser_id) {
            self.cur_tx = Some(fresh);
        }
        let rb = self.rollback_internal();
        let resp = if rb.is_success() {
            Response::new(status_code, format!("{message} (rolled back)"))
        } else {
            Response::new(
                status_code,
                format!("{message} (rollback failed: {})", rb.message),
            )
        };
        resp.without_sqltx_rollback()
    }
}
