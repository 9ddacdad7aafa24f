//! End-to-end scenarios driving the public facade: the full
//! begin/call/commit/undo/redo lifecycle, the failure and re-entry
//! protocols, and crash recovery against a data directory with state
//! injected mid-operation.

use crate::fixtures::TestRig;
use crate::world::kv_args;
use revtx_core::{ArgMap, CallSpec, CallTable, TxStatus};
use serde_json::json;

fn set(rig: &mut TestRig, tx_id: Option<&str>, key: &str, val: &str) -> revtx_core::Response {
    rig.tm.call(tx_id, "kv.set", kv_args(key, val), false)
}

#[test]
fn lifecycle_set_and_commit() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");

    assert_eq!(rig.tm.begin("t1", None, None).code, 200);
    assert_eq!(set(&mut rig, Some("t1"), "A", "1").code, 200);
    assert_eq!(rig.world.get("A").as_deref(), Some("1"));
    assert_eq!(rig.tm.commit(Some("t1")).code, 200);

    assert_eq!(rig.status("t1"), TxStatus::Committed);
    assert_eq!(rig.call_count("t1", CallTable::Call), 0);
    assert_eq!(rig.call_count("t1", CallTable::UndoCall), 1);

    let ser_id = rig.tm.store().get_tx_by_str_id("t1").unwrap().unwrap().ser_id;
    let undo = rig
        .tm
        .store()
        .select_calls(CallTable::UndoCall, ser_id, false, None)
        .unwrap();
    assert_eq!(undo[0].f, "kv.set");
    assert_eq!(undo[0].args.get("val"), Some(&json!("0")));
}

#[test]
fn lifecycle_undo_restores_world_and_swaps_tables() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    rig.tm.commit(Some("t1"));

    assert_eq!(rig.tm.undo(Some("t1")).code, 200);
    assert_eq!(rig.status("t1"), TxStatus::Undone);
    assert_eq!(rig.world.get("A").as_deref(), Some("0"));
    // The redo program replaced the undo program.
    assert_eq!(rig.call_count("t1", CallTable::Call), 1);
    assert_eq!(rig.call_count("t1", CallTable::UndoCall), 0);
}

#[test]
fn lifecycle_redo_reapplies_and_swaps_back() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    rig.tm.commit(Some("t1"));
    rig.tm.undo(Some("t1"));

    assert_eq!(rig.tm.redo(Some("t1")).code, 200);
    assert_eq!(rig.status("t1"), TxStatus::Committed);
    assert_eq!(rig.world.get("A").as_deref(), Some("1"));
    assert_eq!(rig.call_count("t1", CallTable::Call), 0);
    assert_eq!(rig.call_count("t1", CallTable::UndoCall), 1);
}

#[test]
fn undo_executes_inverse_program_in_reverse_order() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    // Two writes to the same key: undoing must apply "restore to 1" before
    // "remove entirely".
    set(&mut rig, Some("t1"), "A", "1");
    set(&mut rig, Some("t1"), "A", "2");
    rig.tm.commit(Some("t1"));

    assert_eq!(rig.tm.undo(Some("t1")).code, 200);
    assert!(rig.world.get("A").is_none());

    assert_eq!(rig.tm.redo(Some("t1")).code, 200);
    assert_eq!(rig.world.get("A").as_deref(), Some("2"));
}

#[test]
fn undo_without_id_picks_most_recently_committed() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    rig.tm.commit(Some("t1"));
    rig.tm.begin("t2", None, None);
    set(&mut rig, Some("t2"), "B", "1");
    rig.tm.commit(Some("t2"));

    assert_eq!(rig.tm.undo(None).code, 200);
    assert_eq!(rig.status("t2"), TxStatus::Undone);
    assert_eq!(rig.status("t1"), TxStatus::Committed);

    // Redo without an id picks the earliest undone.
    rig.tm.undo(None);
    assert_eq!(rig.status("t1"), TxStatus::Undone);
    assert_eq!(rig.tm.redo(None).code, 200);
    assert_eq!(rig.status("t1"), TxStatus::Committed);
    assert_eq!(rig.status("t2"), TxStatus::Undone);
}

#[test]
fn failing_call_rolls_back_earlier_calls() {
    let mut rig = TestRig::new();
    rig.tm.begin("t2", None, None);
    let resp = rig.tm.call_multi(
        Some("t2"),
        vec![
            CallSpec::new("kv.set", kv_args("x", "1")),
            CallSpec::new("kv.fail", kv_args("y", "2")),
        ],
        false,
    );
    assert_eq!(resp.code, 532);
    assert!(resp.message.ends_with("(rolled back)"), "{}", resp.message);
    // The first call's side effect was undone by the automatic rollback.
    assert!(rig.world.get("x").is_none());
    assert_eq!(rig.status("t2"), TxStatus::RolledBack);
    assert_eq!(rig.call_count("t2", CallTable::Call), 0);
    assert_eq!(rig.call_count("t2", CallTable::UndoCall), 0);
}

#[test]
fn function_missing_a_capability_is_rejected_and_rolled_back() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    let resp = set_fn(&mut rig, "kv.nodry");
    assert_eq!(resp.code, 412);
    assert!(resp.message.ends_with("(rolled back)"), "{}", resp.message);
    assert_eq!(rig.status("t1"), TxStatus::RolledBack);
}

#[test]
fn unknown_function_fails_with_500() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    let resp = set_fn(&mut rig, "kv.ghost");
    assert_eq!(resp.code, 500);
    assert!(resp.message.ends_with("(rolled back)"), "{}", resp.message);
}

#[test]
fn malformed_function_name_fails_with_400() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    let resp = rig.tm.call(Some("t1"), "not a name!", ArgMap::new(), false);
    assert_eq!(resp.code, 400);
}

fn set_fn(rig: &mut TestRig, f: &str) -> revtx_core::Response {
    rig.tm.call(Some("t1"), f, kv_args("A", "1"), false)
}

#[test]
fn dry_run_reports_undo_data_and_records_nothing() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    let resp = rig.tm.call(Some("t1"), "kv.set", kv_args("A", "1"), true);
    assert_eq!(resp.code, 200);
    assert_eq!(resp.payload, Some(json!([["kv.del", {"key": "A"}]])));
    assert!(rig.world.get("A").is_none());
    assert_eq!(rig.call_count("t1", CallTable::Call), 0);
    assert_eq!(rig.call_count("t1", CallTable::UndoCall), 0);
    assert_eq!(rig.status("t1"), TxStatus::InProgress);

    // Nothing to do at all: 304.
    rig.world.set("A", "1");
    let resp = rig.tm.call(Some("t1"), "kv.set", kv_args("A", "1"), true);
    assert_eq!(resp.code, 304);
}

#[test]
fn callee_may_reenter_call_during_rollback() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");
    rig.tm.begin("t1", None, None);
    assert_eq!(
        rig.tm
            .call(Some("t1"), "kv.set_reenter_undo", kv_args("A", "1"), false)
            .code,
        200
    );
    assert_eq!(rig.world.get("A").as_deref(), Some("1"));

    // Force a rollback; the recorded inverse is a kv.reenter call which
    // re-enters the facade (and checks that a nested rollback request is
    // ignored).
    let resp = rig.tm.call(Some("t1"), "kv.fail", kv_args("B", "2"), false);
    assert_eq!(resp.code, 532);
    assert!(resp.message.ends_with("(rolled back)"), "{}", resp.message);
    assert_eq!(rig.status("t1"), TxStatus::RolledBack);
    assert_eq!(rig.world.get("A").as_deref(), Some("0"));
    assert!(rig.world.get("B").is_none());
}

#[test]
fn failing_rollback_marks_transaction_inconsistent() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    // Inject an inverse that will itself fail when the rollback runs it.
    let ser_id = rig.tm.current_tx().unwrap().ser_id;
    let ctime = rig.tm.store_mut().now();
    rig.tm
        .store_mut()
        .insert_call(
            CallTable::UndoCall,
            ser_id,
            None,
            ctime,
            "kv.fail",
            &kv_args("x", "1"),
        )
        .unwrap();

    let resp = rig.tm.call(Some("t1"), "kv.fail", kv_args("y", "2"), false);
    assert_eq!(resp.code, 532);
    assert!(
        resp.message.contains("(rollback failed:"),
        "{}",
        resp.message
    );
    assert_eq!(rig.status("t1"), TxStatus::Inconsistent);

    // An inconsistent transaction can only be discarded.
    assert_eq!(rig.tm.commit(Some("t1")).code, 480);
    assert_eq!(rig.tm.discard(Some("t1")).code, 200);
    assert!(rig.tm.store().get_tx_by_str_id("t1").unwrap().is_none());
}

#[test]
fn failing_undo_aborts_back_to_committed() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    rig.tm.commit(Some("t1"));

    // Append a failing entry to the inverse program; undoing processes it
    // first (reverse order) and fails, and the manager aborts the undo.
    let ser_id = rig.tm.store().get_tx_by_str_id("t1").unwrap().unwrap().ser_id;
    let ctime = rig.tm.store_mut().now();
    rig.tm
        .store_mut()
        .insert_call(
            CallTable::UndoCall,
            ser_id,
            None,
            ctime,
            "kv.fail",
            &kv_args("x", "1"),
        )
        .unwrap();

    let resp = rig.tm.undo(Some("t1"));
    assert_eq!(resp.code, 532);
    assert!(resp.message.ends_with("(rolled back)"), "{}", resp.message);
    assert_eq!(rig.status("t1"), TxStatus::Committed);
    assert_eq!(rig.world.get("A").as_deref(), Some("1"));
}

#[test]
fn commit_of_aborting_transaction_finishes_the_rollback() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    // Simulate a crash that left the transaction mid-abort.
    let ser_id = rig.tm.current_tx().unwrap().ser_id;
    rig.tm
        .store_mut()
        .update_tx_status(ser_id, TxStatus::Aborting, true)
        .unwrap();

    let resp = rig.tm.commit(Some("t1"));
    assert_eq!(resp.code, 200);
    assert_eq!(resp.message, "Rolled back");
    assert_eq!(rig.status("t1"), TxStatus::RolledBack);
    assert!(rig.world.get("A").is_none());
}

// --- Crash recovery ---

#[test]
fn crash_between_recording_and_real_call_recovers_to_rolled_back() {
    let mut rig = TestRig::new();
    rig.tm.begin("t3", None, None);
    // Inject exactly the state the loop leaves between recording a call's
    // rows and making the real call: forward row, inverse row, no side
    // effect, status still `i`.
    let ser_id = rig.tm.current_tx().unwrap().ser_id;
    let ctime = rig.tm.store_mut().now();
    rig.tm
        .store_mut()
        .insert_call(CallTable::Call, ser_id, None, ctime, "kv.set", &kv_args("A", "1"))
        .unwrap();
    let ctime = rig.tm.store_mut().now();
    rig.tm
        .store_mut()
        .insert_call(CallTable::UndoCall, ser_id, None, ctime, "kv.del", &kv_args("A", ""))
        .unwrap();

    let rig = rig.reopen();
    assert_eq!(rig.status("t3"), TxStatus::RolledBack);
    assert!(rig.world.get("A").is_none());
    assert_eq!(rig.call_count("t3", CallTable::Call), 0);
    assert_eq!(rig.call_count("t3", CallTable::UndoCall), 0);
}

#[test]
fn crash_mid_abort_resumes_strictly_after_completed_calls() {
    let mut rig = TestRig::new();
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    set(&mut rig, Some("t1"), "B", "2");

    // Simulate: a rollback ran its first (reversed) inverse - removing B -
    // then the process died after advancing the resume marker.
    let ser_id = rig.tm.current_tx().unwrap().ser_id;
    let undo = rig
        .tm
        .store()
        .select_calls(CallTable::UndoCall, ser_id, true, None)
        .unwrap();
    let completed = &undo[0];
    assert_eq!(completed.args.get("key"), Some(&json!("B")));
    rig.world.del("B");
    rig.tm
        .store_mut()
        .update_tx_status(ser_id, TxStatus::Aborting, true)
        .unwrap();
    let completed_id = completed.id;
    rig.tm
        .store_mut()
        .set_last_call_id(ser_id, completed_id)
        .unwrap();

    let rig = rig.reopen();
    assert_eq!(rig.status("t1"), TxStatus::RolledBack);
    assert!(rig.world.get("A").is_none());
    assert!(rig.world.get("B").is_none());
}

#[test]
fn crash_mid_undo_recovers_to_committed_state() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    rig.tm.commit(Some("t1"));

    // Simulate a crash just after undo flipped the status: the undo
    // program is intact, nothing was executed yet.
    let ser_id = rig.tm.store().get_tx_by_str_id("t1").unwrap().unwrap().ser_id;
    rig.tm
        .store_mut()
        .update_tx_status(ser_id, TxStatus::Undoing, true)
        .unwrap();

    let rig = rig.reopen();
    assert_eq!(rig.status("t1"), TxStatus::Committed);
    assert_eq!(rig.world.get("A").as_deref(), Some("1"));
    // Still undoable afterwards.
    let mut rig = rig;
    assert_eq!(rig.tm.undo(Some("t1")).code, 200);
    assert_eq!(rig.world.get("A").as_deref(), Some("0"));
}

#[test]
fn crash_mid_redo_recovers_to_undone_state() {
    let mut rig = TestRig::new();
    rig.world.set("A", "0");
    rig.tm.begin("t1", None, None);
    set(&mut rig, Some("t1"), "A", "1");
    rig.tm.commit(Some("t1"));
    rig.tm.undo(Some("t1"));

    let ser_id = rig.tm.store().get_tx_by_str_id("t1").unwrap().unwrap().ser_id;
    rig.tm
        .store_mut()
        .update_tx_status(ser_id, TxStatus::Redoing, true)
        .unwrap();

    let rig = rig.reopen();
    assert_eq!(rig.status("t1"), TxStatus::Undone);
    assert_eq!(rig.world.get("A").as_deref(), Some("0"));
}

#[test]
fn committed_transactions_survive_restart_and_duplicate_ids_stay_rejected() {
    let mut rig = TestRig::new();
    rig.tm.begin("t4", None, None);
    set(&mut rig, Some("t4"), "A", "1");
    rig.tm.commit(Some("t4"));

    let mut rig = rig.reopen();
    assert_eq!(rig.status("t4"), TxStatus::Committed);
    assert_eq!(rig.tm.begin("t4", None, None).code, 409);

    // The undo program also survived: undo still works after restart.
    assert_eq!(rig.tm.undo(Some("t4")).code, 200);
    assert!(rig.world.get("A").is_none());
}
