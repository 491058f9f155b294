use std::sync::Arc;
use std::time::Duration;

use gridrelay_config::EngineConfig;
use gridrelay_core::{ErrorCode, Operation, SpreadsheetId};
use gridrelay_engine::harness::FakeSheets;
use gridrelay_engine::model::{SheetModel, WorkbookModel};
use gridrelay_engine::{Direction, Engine, ManualClock, TransactionState};
use gridrelay_protocol::{ExtendedValue, RemoteError};
use serde_json::json;

const BOOK: &str = "book";

fn op(action: &str, params: serde_json::Value) -> Operation {
    Operation::new(BOOK, action, params)
}

fn seeded() -> Arc<FakeSheets> {
    let fake = Arc::new(FakeSheets::with_default_book(BOOK));
    fake.set_cell(BOOK, "Sheet1", 0, 0, json!("name"));
    fake.set_cell(BOOK, "Sheet1", 0, 1, json!("amount"));
    fake.set_cell(BOOK, "Sheet1", 1, 0, json!("rent"));
    fake.set_cell(BOOK, "Sheet1", 1, 1, json!(1200));
    fake.set_cell(BOOK, "Sheet1", 2, 1, json!("=B2*2"));
    fake
}

fn small_batches() -> EngineConfig {
    let mut config = EngineConfig::default();
    // One single-cell write per batch.
    config.dispatch.batch_limit_bytes = 350;
    config
}

// -------------------------------------------------------------------------
// Undo / redo
// -------------------------------------------------------------------------

#[test]
fn undo_restores_exact_state_and_redo_reapplies() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake.clone());
    let sheet = SpreadsheetId::from(BOOK);
    let before = fake.state_json(BOOK);

    smol::block_on(async {
        let ops = vec![
            op("write_range", json!({ "range": "A2:B3", "values": [["gas", 80], ["water", 40]] })),
            op(
                "format_range",
                json!({ "range": "A1:B1", "bold": true, "background": [0.2, 0.4, 0.6] }),
            ),
            op("insert_dimension", json!({ "dimension": "ROWS", "start": 1, "count": 2 })),
            op("append_rows", json!({ "values": [["tail", 1]] })),
            op("find_replace", json!({ "find": "rent", "replacement": "lease" })),
        ];
        for o in ops {
            let result = engine.execute(o).await;
            assert!(result.success, "{:?}", result.error);
        }
        let after = fake.state_json(BOOK);
        assert_ne!(after, before);
        assert_eq!(engine.history(&sheet).cursor, 5);

        for _ in 0..5 {
            let moved = engine.undo(&sheet).await.unwrap();
            assert_eq!(moved.direction, Direction::Undo);
        }
        assert_eq!(fake.state_json(BOOK), before);

        let err = engine.undo(&sheet).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);

        for _ in 0..5 {
            engine.redo(&sheet).await.unwrap();
        }
        assert_eq!(fake.state_json(BOOK), after);
        assert_eq!(engine.redo(&sheet).await.unwrap_err().code, ErrorCode::Validation);
    });
}

#[test]
fn new_write_discards_redo_branch() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake.clone());
    let sheet = SpreadsheetId::from(BOOK);

    smol::block_on(async {
        engine.execute(op("write_range", json!({ "range": "C1", "values": [["x"]] }))).await;
        engine.undo(&sheet).await.unwrap();
        engine.execute(op("write_range", json!({ "range": "D1", "values": [["y"]] }))).await;
        assert_eq!(engine.redo(&sheet).await.unwrap_err().code, ErrorCode::Validation);
    });

    let view = engine.history(&sheet);
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.cursor, 1);
    assert!(view.journal.len() >= 3);
}

#[test]
fn irreversible_entry_cannot_be_undone() {
    let book = WorkbookModel::new("b")
        .with_sheet(SheetModel::new(0, "Main", 100, 10))
        .with_sheet(SheetModel::new(9, "Scratch", 100, 10));
    let fake = Arc::new(FakeSheets::with_book(BOOK, book));
    let engine = Engine::new(EngineConfig::default(), fake.clone());
    let sheet = SpreadsheetId::from(BOOK);

    smol::block_on(async {
        assert!(engine.execute(op("delete_sheet", json!({ "sheet": "Scratch" }))).await.success);
        let err = engine.undo(&sheet).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    });
    assert!(!engine.history(&sheet).entries[0].reversible);
}

#[test]
fn revert_to_rewinds_every_later_entry() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake.clone());
    let sheet = SpreadsheetId::from(BOOK);

    smol::block_on(async {
        engine.execute(op("write_range", json!({ "range": "D1", "values": [["one"]] }))).await;
        let checkpoint = fake.state_json(BOOK);
        let target = engine.history(&sheet).entries[0].id.clone();

        engine.execute(op("write_range", json!({ "range": "D2", "values": [["two"]] }))).await;
        let columns = json!({ "dimension": "COLUMNS", "start": 0, "count": 1 });
        engine.execute(op("delete_dimension", columns)).await;
        engine.execute(op("add_sheet", json!({ "title": "Extra" }))).await;

        let moved = engine.revert_to(&sheet, &target).await.unwrap();
        assert_eq!(moved.entries, 3);
        assert_eq!(moved.batches, 1);
        assert_eq!(fake.state_json(BOOK), checkpoint);
        assert_eq!(engine.history(&sheet).cursor, 1);

        // The reverted entries can be redone in order.
        engine.redo(&sheet).await.unwrap();
        let d2 = fake.cell(BOOK, "Sheet1", 1, 3).unwrap();
        assert!(d2.user_entered_value.is_some());
    });
}

#[test]
fn revert_to_unknown_entry_is_not_found() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake.clone());
    let sheet = SpreadsheetId::from(BOOK);

    let err = smol::block_on(async {
        engine.execute(op("write_range", json!({ "range": "D1", "values": [["one"]] }))).await;
        engine.revert_to(&sheet, &"ent_missing".into()).await.unwrap_err()
    });
    assert_eq!(err.code, ErrorCode::NotFound);
}

// -------------------------------------------------------------------------
// Transactions
// -------------------------------------------------------------------------

#[test]
fn commit_is_all_or_nothing_across_batches() {
    let fake = seeded();
    let engine = Engine::new(small_batches(), fake.clone());
    let before = fake.state_json(BOOK);

    let txn = engine.begin(BOOK);
    for (i, cell) in ["D1", "D2", "D3"].iter().enumerate() {
        engine.queue(&txn, op("write_range", json!({ "range": cell, "values": [[i]] }))).unwrap();
    }
    // First batch lands, second is rejected.
    fake.fail_batch_after(1, RemoteError::from_status(400, "Invalid requests[0]"));

    let report = smol::block_on(engine.commit(&txn)).unwrap();

    assert_eq!(report.state, TransactionState::Aborted);
    assert_eq!(report.error.as_ref().map(|e| e.code), Some(ErrorCode::Validation));
    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| !r.success));
    // Applied batch, failed batch, compensation.
    assert_eq!(fake.batch_calls(), 3);
    assert_eq!(fake.state_json(BOOK), before);
    assert!(engine.history(&SpreadsheetId::from(BOOK)).entries.is_empty());
    assert_eq!(engine.status(&txn).unwrap().state, TransactionState::Aborted);
}

#[test]
fn late_landing_batch_is_compensated() {
    let fake = seeded();
    let mut config = small_batches();
    config.dispatch.timeout_ms = 100;
    let engine = Engine::new(config, fake.clone());
    let before = fake.state_json(BOOK);

    let txn = engine.begin(BOOK);
    for (i, cell) in ["D1", "D2", "D3"].iter().enumerate() {
        engine.queue(&txn, op("write_range", json!({ "range": cell, "values": [[i]] }))).unwrap();
    }
    // Second batch is applied remotely but its reply comes after the timeout.
    fake.stall_batch_after(1, Duration::from_millis(300), true);

    let report = smol::block_on(engine.commit(&txn)).unwrap();

    assert_eq!(report.state, TransactionState::Aborted);
    assert_eq!(report.error.as_ref().map(|e| e.code), Some(ErrorCode::Timeout));
    assert_eq!(fake.cell(BOOK, "Sheet1", 1, 3), None);
    assert_eq!(fake.state_json(BOOK), before);
}

#[test]
fn timed_out_structural_batch_that_never_landed_is_left_alone() {
    let fake = seeded();
    let mut config = EngineConfig::default();
    config.dispatch.timeout_ms = 100;
    let engine = Engine::new(config, fake.clone());
    let before = fake.state_json(BOOK);

    let txn = engine.begin(BOOK);
    engine
        .queue(&txn, op("insert_dimension", json!({ "dimension": "ROWS", "start": 1, "count": 2 })))
        .unwrap();
    fake.stall_batch_after(0, Duration::from_millis(300), false);

    let report = smol::block_on(engine.commit(&txn)).unwrap();

    assert_eq!(report.state, TransactionState::Aborted);
    assert_eq!(report.error.as_ref().map(|e| e.code), Some(ErrorCode::Timeout));
    // No compensating delete went out against rows that were never added.
    assert_eq!(fake.batch_calls(), 1);
    assert_eq!(fake.state_json(BOOK), before);
}

#[test]
fn timed_out_structural_batch_that_landed_is_reversed() {
    let fake = seeded();
    let mut config = EngineConfig::default();
    config.dispatch.timeout_ms = 100;
    let engine = Engine::new(config, fake.clone());
    let before = fake.state_json(BOOK);

    let txn = engine.begin(BOOK);
    engine
        .queue(&txn, op("insert_dimension", json!({ "dimension": "ROWS", "start": 1, "count": 2 })))
        .unwrap();
    fake.stall_batch_after(0, Duration::from_millis(300), true);

    let report = smol::block_on(engine.commit(&txn)).unwrap();

    assert_eq!(report.state, TransactionState::Aborted);
    assert_eq!(fake.batch_calls(), 2);
    assert_eq!(fake.state_json(BOOK), before);
    let a2 = fake.cell(BOOK, "Sheet1", 1, 0).unwrap();
    assert_eq!(a2.user_entered_value, Some(ExtendedValue::StringValue("rent".into())));
}

#[test]
fn dropped_commit_future_aborts_transaction() {
    let fake = seeded();
    fake.set_latency(Duration::from_millis(200));
    let engine = Engine::new(EngineConfig::default(), fake.clone());

    let txn = engine.begin(BOOK);
    engine.queue(&txn, op("write_range", json!({ "range": "D1", "values": [[1]] }))).unwrap();

    let finished = smol::block_on(smol::future::or(
        async { Some(engine.commit(&txn).await) },
        async {
            smol::Timer::after(Duration::from_millis(50)).await;
            None
        },
    ));
    assert!(finished.is_none());

    let status = engine.status(&txn).unwrap();
    assert_eq!(status.state, TransactionState::Aborted);
    assert_eq!(status.error.map(|e| e.code), Some(ErrorCode::Cancelled));
}

#[test]
fn multi_batch_commit_refuses_irreversible_steps() {
    let book = WorkbookModel::new("b")
        .with_sheet(SheetModel::new(0, "Main", 100, 10))
        .with_sheet(SheetModel::new(9, "Scratch", 100, 10));
    let fake = Arc::new(FakeSheets::with_book(BOOK, book));
    let engine = Engine::new(small_batches(), fake.clone());

    let txn = engine.begin(BOOK);
    engine.queue(&txn, op("write_range", json!({ "range": "A1", "values": [[1]] }))).unwrap();
    engine.queue(&txn, op("write_range", json!({ "range": "A2", "values": [[2]] }))).unwrap();
    engine.queue(&txn, op("delete_sheet", json!({ "sheet": "Scratch" }))).unwrap();

    let report = smol::block_on(engine.commit(&txn)).unwrap();
    assert_eq!(report.error.map(|e| e.code), Some(ErrorCode::Validation));
    assert_eq!(fake.batch_calls(), 0);
}

#[test]
fn committed_transaction_is_one_history_entry_per_op() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake.clone());

    let txn = engine.begin(BOOK);
    engine.queue(&txn, op("add_sheet", json!({ "title": "Summary" }))).unwrap();
    engine
        .queue(&txn, op("write_range", json!({ "range": "Summary!A1", "values": [["total"]] })))
        .unwrap();
    let report = smol::block_on(engine.commit(&txn)).unwrap();

    assert_eq!(report.state, TransactionState::Committed, "{:?}", report.error);
    assert_eq!(fake.batch_sizes(), vec![2]);
    let view = engine.history(&SpreadsheetId::from(BOOK));
    assert_eq!(view.entries.len(), 2);
    assert!(view.entries.iter().all(|e| e.transaction_id.as_ref() == Some(&txn)));

    // Closed transactions take nothing more.
    let err = engine.queue(&txn, op("clear_range", json!({ "range": "A1" }))).unwrap_err();
    assert_eq!(err.code, ErrorCode::TransactionClosed);
    assert_eq!(smol::block_on(engine.commit(&txn)).unwrap_err().code, ErrorCode::TransactionClosed);
}

#[test]
fn rollback_discards_queue() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake.clone());

    let txn = engine.begin(BOOK);
    engine.queue(&txn, op("clear_range", json!({ "range": "A1:B3" }))).unwrap();
    engine.rollback(&txn).unwrap();

    assert_eq!(engine.status(&txn).unwrap().state, TransactionState::RolledBack);
    assert_eq!(fake.batch_calls() + fake.metadata_calls(), 0);
}

#[test]
fn reads_cannot_be_queued() {
    let fake = seeded();
    let engine = Engine::new(EngineConfig::default(), fake);
    let txn = engine.begin(BOOK);
    let err = engine.queue(&txn, op("read_range", json!({ "range": "A1" }))).unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);
}

#[test]
fn idle_transaction_expires_then_disappears() {
    let fake = seeded();
    let clock = Arc::new(ManualClock::new());
    let engine = Engine::with_clock(EngineConfig::default(), fake.clone(), clock.clone());

    let txn = engine.begin(BOOK);
    engine.queue(&txn, op("clear_range", json!({ "range": "A1" }))).unwrap();
    clock.advance(Duration::from_secs(5 * 60 + 1));

    let err = smol::block_on(engine.commit(&txn)).unwrap_err();
    assert_eq!(err.code, ErrorCode::TransactionExpired);
    let status = engine.status(&txn).unwrap();
    assert_eq!(status.state, TransactionState::Aborted);
    assert_eq!(status.error.map(|e| e.code), Some(ErrorCode::TransactionExpired));
    assert_eq!(fake.batch_calls(), 0);

    clock.advance(Duration::from_secs(15 * 60 + 1));
    assert_eq!(engine.status(&txn).unwrap_err().code, ErrorCode::TransactionNotFound);
}
