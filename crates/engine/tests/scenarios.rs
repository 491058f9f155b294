use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use gridrelay_config::{EngineConfig, QuotaPolicy};
use gridrelay_core::{col_to_letters, ErrorCode, Operation, Payload};
use gridrelay_engine::harness::FakeSheets;
use gridrelay_engine::quota::{Admission, BucketKind, QuotaManager};
use gridrelay_engine::{CancelOutcome, Engine, ManualClock, TransactionState};
use serde_json::json;

fn engine_on(fake: &Arc<FakeSheets>) -> Engine {
    Engine::new(EngineConfig::default(), fake.clone())
}

fn write(range: &str, values: serde_json::Value) -> Operation {
    Operation::new("sheet-1", "write_range", json!({ "range": range, "values": values }))
}

fn read(range: &str) -> Operation {
    Operation::new("sheet-1", "read_range", json!({ "range": range }))
}

fn revision_of(payload: Option<Payload>) -> String {
    match payload {
        Some(Payload::Values { revision, .. }) => revision,
        other => panic!("expected values, got {:?}", other),
    }
}

// -------------------------------------------------------------------------
// Compile and batch
// -------------------------------------------------------------------------

#[test]
fn write_two_by_two_is_one_request() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    let result = smol::block_on(engine.execute(write("A1:B2", json!([[1, 2], [3, 4]]))));

    assert!(result.success);
    assert_eq!(result.payload, Some(Payload::CellsUpdated { updated_cells: 4 }));
    assert_eq!(fake.batch_sizes(), vec![1]);
    let cell = fake.cell("sheet-1", "Sheet1", 1, 1).unwrap();
    assert_eq!(cell.user_entered_value, Some(gridrelay_protocol::ExtendedValue::NumberValue(4.0)));
}

#[test]
fn oversized_submission_splits_in_order() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);
    let pattern = "0".repeat(900);

    let ops: Vec<Operation> = (0..10_000u32)
        .map(|i| {
            let cell = format!("{}{}", col_to_letters(i % 10), i / 10 + 1);
            Operation::new(
                "sheet-1",
                "format_range",
                json!({ "range": cell, "number_format": { "type": "NUMBER", "pattern": pattern } }),
            )
        })
        .collect();
    let ids: Vec<_> = ops.iter().map(|op| op.id.clone()).collect();

    let results = smol::block_on(engine.execute_many(ops));

    assert_eq!(results.len(), 10_000);
    assert!(results.iter().all(|r| r.success), "{:?}", results.iter().find(|r| !r.success));
    let returned: Vec<_> = results.iter().map(|r| r.operation_id.clone()).collect();
    assert_eq!(returned, ids);

    let sizes = fake.batch_sizes();
    assert!(sizes.len() >= 2, "expected a split, got {:?}", sizes);
    assert_eq!(sizes.iter().sum::<usize>(), 10_000);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.batches.dispatched as usize, sizes.len());
    assert!(snapshot.batches.largest_bytes <= 9_000_000);
    assert_eq!(snapshot.batches.splits as usize, sizes.len() - 1);

    // Last op landed on the last cell.
    let last = fake.cell("sheet-1", "Sheet1", 999, 9).unwrap();
    let format = last.user_entered_format.unwrap().number_format.unwrap();
    assert_eq!(format.pattern.as_deref(), Some(pattern.as_str()));
}

#[test]
fn failing_operation_does_not_block_the_rest() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    let results = smol::block_on(engine.execute_many(vec![
        write("A1", json!([["ok"]])),
        Operation::new("sheet-1", "delete_sheet", json!({ "sheet": "Nope" })),
        Operation::new("sheet-1", "explode", json!({})),
        write("B1", json!([["also ok"]])),
    ]));

    assert_eq!(results.len(), 4);
    assert!(results[0].success);
    assert_eq!(results[1].error_code(), Some(ErrorCode::NotFound));
    assert_eq!(results[2].error_code(), Some(ErrorCode::UnsupportedAction));
    assert!(results[3].success);
    assert_eq!(fake.batch_sizes(), vec![2]);
}

#[test]
fn read_sees_earlier_writes_in_the_same_submission() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    let ops = vec![write("C3", json!([["x"]])), read("C3")];
    let results = smol::block_on(engine.execute_many(ops));

    match &results[1].payload {
        Some(Payload::Values { values, .. }) => assert_eq!(values, &vec![vec![json!("x")]]),
        other => panic!("unexpected {:?}", other),
    }
}

// -------------------------------------------------------------------------
// Conflicts
// -------------------------------------------------------------------------

#[test]
fn stale_baseline_conflicts_and_writes_nothing() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    smol::block_on(async {
        let r1 = revision_of(engine.execute(read("A1:B2")).await.payload);
        fake.set_cell("sheet-1", "Sheet1", 0, 0, json!("someone else"));

        let txn = engine.begin("sheet-1");
        let guarded = write("A1:B2", json!([[1, 2], [3, 4]])).with_baseline(r1.clone());
        engine.queue(&txn, guarded).unwrap();
        let report = engine.commit(&txn).await.unwrap();

        assert_eq!(report.state, TransactionState::Aborted);
        let error = report.error.unwrap();
        assert_eq!(error.code, ErrorCode::Conflict);
        let detail = error.conflict.unwrap();
        assert_eq!(detail.expected, r1);
        assert_ne!(detail.actual, r1);
        assert!(report.results.iter().all(|r| r.error_code() == Some(ErrorCode::Conflict)));
    });

    assert_eq!(fake.batch_calls(), 0);
    assert_eq!(fake.cell("sheet-1", "Sheet1", 1, 1), None);
}

#[test]
fn matching_baseline_applies() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    let result = smol::block_on(async {
        let r1 = revision_of(engine.execute(read("A1")).await.payload);
        engine.execute(write("A1", json!([[7]])).with_baseline(r1)).await
    });

    assert!(result.success, "{:?}", result.error);
}

#[test]
fn keep_remote_skips_and_keep_local_overwrites() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    smol::block_on(async {
        let r1 = revision_of(engine.execute(read("A1")).await.payload);
        fake.set_cell("sheet-1", "Sheet1", 0, 0, json!("theirs"));

        let skipped = engine
            .execute(
                write("A1", json!([["mine"]]))
                    .with_baseline(r1.clone())
                    .with_resolution("keep_remote"),
            )
            .await;
        assert!(matches!(skipped.payload, Some(Payload::Skipped { .. })));
        assert_eq!(fake.batch_calls(), 0);

        let forced = engine
            .execute(write("A1", json!([["mine"]])).with_baseline(r1).with_resolution("keep_local"))
            .await;
        assert!(forced.success);
    });

    let cell = fake.cell("sheet-1", "Sheet1", 0, 0).unwrap();
    assert_eq!(
        cell.user_entered_value,
        Some(gridrelay_protocol::ExtendedValue::StringValue("mine".into()))
    );
}

// -------------------------------------------------------------------------
// Quota
// -------------------------------------------------------------------------

#[test]
fn concurrent_callers_share_one_write_window() {
    let clock = Arc::new(ManualClock::new());
    let mut config = EngineConfig::default().quota;
    config.policy = QuotaPolicy::FailFast;
    let quota = Arc::new(QuotaManager::new(&config, clock));
    let start = Arc::new(Barrier::new(5));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let (quota, start) = (quota.clone(), start.clone());
            thread::spawn(move || {
                start.wait();
                smol::block_on(quota.acquire(BucketKind::Write, 20))
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let granted = outcomes.iter().filter(|o| o.is_ok()).count();
    let limited = outcomes
        .iter()
        .filter(|o| matches!(o, Err(e) if e.code == ErrorCode::RateLimitExceeded))
        .count();
    assert_eq!((granted, limited), (3, 2));
    assert_eq!(quota.snapshot().write.tokens, 0);
}

#[test]
fn single_token_grants_never_exceed_capacity() {
    let clock = Arc::new(ManualClock::new());
    let quota = Arc::new(QuotaManager::new(&EngineConfig::default().quota, clock));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let quota = quota.clone();
            thread::spawn(move || {
                (0..20)
                    .filter(|_| quota.try_acquire(BucketKind::Write, 1) == Ok(Admission::Granted))
                    .count()
            })
        })
        .collect();
    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(granted, 60);
    assert_eq!(quota.snapshot().write.tokens, 0);
}

// -------------------------------------------------------------------------
// Cache
// -------------------------------------------------------------------------

#[test]
fn reads_are_cached_until_ttl_or_write() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let clock = Arc::new(ManualClock::new());
    let engine = Engine::with_clock(EngineConfig::default(), fake.clone(), clock.clone());

    smol::block_on(async {
        engine.execute(read("A1:C3")).await;
        engine.execute(read("A1:C3")).await;
        assert_eq!(fake.values_calls(), 1);

        // A different render mode is a different entry.
        engine
            .execute(Operation::new(
                "sheet-1",
                "read_range",
                json!({ "range": "A1:C3", "value_render": "FORMULA" }),
            ))
            .await;
        assert_eq!(fake.values_calls(), 2);

        clock.advance(Duration::from_millis(30_001));
        engine.execute(read("A1:C3")).await;
        assert_eq!(fake.values_calls(), 3);

        engine.execute(write("Z9", json!([[1]]))).await;
        let after = engine.execute(read("A1:C3")).await;
        assert!(after.success);
        assert_eq!(fake.values_calls(), 4);
    });

    let cache = engine.snapshot().cache;
    assert_eq!(cache.hits, 1);
    assert_eq!(cache.misses, 4);
}

#[test]
fn metadata_read_summarizes_sheets() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    let result = smol::block_on(async {
        engine.execute(Operation::new("sheet-1", "add_sheet", json!({ "title": "Q3" }))).await;
        engine.execute(Operation::new("sheet-1", "get_metadata", json!({}))).await
    });

    match result.payload {
        Some(Payload::Metadata { sheets, grid, .. }) => {
            let titles: Vec<_> = sheets.iter().map(|s| s.title.as_str()).collect();
            assert_eq!(titles, vec!["Sheet1", "Q3"]);
            assert_eq!(sheets[0].row_count, 1000);
            assert!(grid.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
}

// -------------------------------------------------------------------------
// Cancellation
// -------------------------------------------------------------------------

#[test]
fn cancel_waiting_operation() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    fake.set_latency(Duration::from_millis(100));
    let engine = Arc::new(engine_on(&fake));

    let first = {
        let engine = engine.clone();
        thread::spawn(move || smol::block_on(engine.execute(write("A1", json!([["first"]])))))
    };
    thread::sleep(Duration::from_millis(50));
    let second = {
        let engine = engine.clone();
        thread::spawn(move || {
            smol::block_on(engine.execute(write("B1", json!([["second"]])).with_id("op_second")))
        })
    };
    thread::sleep(Duration::from_millis(100));

    assert_eq!(engine.cancel(&"op_second".into()).unwrap(), CancelOutcome::Flagged);

    assert!(first.join().unwrap().success);
    let second = second.join().unwrap();
    assert_eq!(second.error_code(), Some(ErrorCode::Cancelled));
    assert_eq!(fake.cell("sheet-1", "Sheet1", 0, 1), None);
    assert_eq!(engine.cancel(&"op_second".into()).unwrap_err().code, ErrorCode::NotFound);
}

#[test]
fn cancel_in_flight_operation_is_too_late() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    fake.set_latency(Duration::from_millis(150));
    let engine = Arc::new(engine_on(&fake));

    let running = {
        let engine = engine.clone();
        thread::spawn(move || {
            smol::block_on(engine.execute(write("A1", json!([["sent"]])).with_id("op_sent")))
        })
    };
    while fake.batch_calls() == 0 {
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(engine.cancel(&"op_sent".into()).unwrap(), CancelOutcome::TooLate);

    let result = running.join().unwrap();
    assert!(result.success, "{:?}", result.error);
    assert!(fake.cell("sheet-1", "Sheet1", 0, 0).is_some());
    assert_eq!(engine.cancel(&"op_sent".into()).unwrap_err().code, ErrorCode::NotFound);
}

#[test]
fn cancel_removes_queued_operation() {
    let fake = Arc::new(FakeSheets::with_default_book("sheet-1"));
    let engine = engine_on(&fake);

    let txn = engine.begin("sheet-1");
    engine.queue(&txn, write("A1", json!([[1]])).with_id("op_keep")).unwrap();
    engine.queue(&txn, write("A2", json!([[2]])).with_id("op_drop")).unwrap();

    let outcome = engine.cancel(&"op_drop".into()).unwrap();
    assert_eq!(outcome, CancelOutcome::RemovedFromTransaction { transaction_id: txn.clone() });

    let report = smol::block_on(engine.commit(&txn)).unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.state, TransactionState::Committed);
    assert_eq!(fake.cell("sheet-1", "Sheet1", 1, 0), None);
}
