//! Conflict detector.
//!
//! Compares an operation's baseline revision against a fresh (uncached)
//! read of the range it touches. What happens on a mismatch is the
//! caller's choice, carried on the operation as its resolution.

use gridrelay_core::{A1Range, ConflictResolution, CoreError, NormalizedOp, Result, Scope};

use crate::dispatch::Dispatcher;
use crate::model::WorkbookModel;
use crate::revision;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// `keep_remote` after a mismatch: drop the write.
    Skip { reason: String },
}

/// The sheet-qualified range a revision is computed over.
pub fn target_range(op: &NormalizedOp, book: &WorkbookModel) -> Result<A1Range> {
    match op.params.scope() {
        Scope::Range(range) => {
            let grid = book.grid_range(range)?;
            let sheet = book.sheet(grid.sheet_id)?;
            Ok(range.clone().with_sheet(&sheet.title))
        }
        Scope::Sheet(sheet) => Ok(A1Range::whole_sheet(&book.resolve(sheet)?.title)),
        Scope::Spreadsheet => Err(CoreError::invalid_field(
            "baselineRevision",
            format!("{} is not scoped to a range or sheet", op.action.label()),
        )),
    }
}

/// Check one operation. A manual mismatch is a CONFLICT error carrying
/// both revisions.
pub async fn check(
    op: &NormalizedOp,
    book: &WorkbookModel,
    dispatcher: &Dispatcher,
) -> Result<Verdict> {
    let Some(baseline) = op.baseline_revision.as_deref() else {
        return Ok(Verdict::Proceed);
    };
    if op.resolution == ConflictResolution::KeepLocal {
        log::debug!("{}: keep_local, skipping revision check", op.id);
        return Ok(Verdict::Proceed);
    }

    let target = target_range(op, book)?.to_a1();
    let render = revision::render_of(baseline);
    let live = dispatcher.get_values(&op.spreadsheet_id, &target, render).await?;
    let actual = revision::revision(render, &live.values);
    if actual == baseline {
        return Ok(Verdict::Proceed);
    }

    log::warn!("{}: {} changed since baseline ({} != {})", op.id, target, baseline, actual);
    match op.resolution {
        ConflictResolution::KeepRemote => Ok(Verdict::Skip {
            reason: format!(
                "{} changed remotely (expected {}, found {})",
                target, baseline, actual
            ),
        }),
        _ => Err(CoreError::conflict(target, baseline, actual)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::harness::FakeSheets;
    use crate::quota::QuotaManager;
    use gridrelay_config::{DispatchConfig, QuotaConfig};
    use gridrelay_core::{normalize, ErrorCode, Operation, SpreadsheetId};
    use gridrelay_protocol::{SpreadsheetQuery, ValueRenderOption};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<FakeSheets>, Dispatcher) {
        let fake = Arc::new(FakeSheets::with_default_book("s"));
        let quota = Arc::new(QuotaManager::new(&QuotaConfig::default(), Arc::new(RealClock)));
        let dispatcher = Dispatcher::new(fake.clone(), quota, DispatchConfig::default());
        (fake, dispatcher)
    }

    fn live_book(fake: &FakeSheets, dispatcher: &Dispatcher) -> WorkbookModel {
        let _ = fake;
        let id: SpreadsheetId = "s".into();
        let meta = dispatcher.get_spreadsheet(&id, SpreadsheetQuery::metadata());
        let meta = smol::block_on(meta).unwrap();
        WorkbookModel::from_spreadsheet(&meta)
    }

    fn write_op(baseline: &str, resolution: &str) -> NormalizedOp {
        let op = Operation::new("s", "write_range", json!({"range": "A1:B1", "values": [[1, 2]]}))
            .with_baseline(baseline)
            .with_resolution(resolution);
        normalize(&op).unwrap()
    }

    fn current_revision(dispatcher: &Dispatcher) -> String {
        let render = ValueRenderOption::FormattedValue;
        let live = smol::block_on(dispatcher.get_values(&"s".into(), "Sheet1!A1:B1", render))
            .unwrap();
        revision::revision(ValueRenderOption::FormattedValue, &live.values)
    }

    #[test]
    fn test_matching_baseline_proceeds() {
        let (fake, d) = setup();
        let book = live_book(&fake, &d);
        let rev = current_revision(&d);
        let verdict = smol::block_on(check(&write_op(&rev, "manual"), &book, &d)).unwrap();
        assert_eq!(verdict, Verdict::Proceed);
    }

    #[test]
    fn test_stale_baseline_conflicts() {
        let (fake, d) = setup();
        let book = live_book(&fake, &d);
        let rev = current_revision(&d);
        fake.set_cell("s", "Sheet1", 0, 0, json!("external"));
        let err = smol::block_on(check(&write_op(&rev, "manual"), &book, &d)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
        let detail = err.conflict.unwrap();
        assert_eq!(detail.expected, rev);
        assert_eq!(detail.range, "Sheet1!A1:B1");
    }

    #[test]
    fn test_keep_remote_skips_and_keep_local_bypasses() {
        let (fake, d) = setup();
        let book = live_book(&fake, &d);
        let rev = current_revision(&d);
        fake.set_cell("s", "Sheet1", 0, 0, json!("external"));
        let verdict = smol::block_on(check(&write_op(&rev, "keep_remote"), &book, &d)).unwrap();
        assert!(matches!(verdict, Verdict::Skip { .. }));

        let before = fake.values_calls();
        let verdict = smol::block_on(check(&write_op(&rev, "KEEP_LOCAL"), &book, &d)).unwrap();
        assert_eq!(verdict, Verdict::Proceed);
        assert_eq!(fake.values_calls(), before);
    }

    #[test]
    fn test_spreadsheet_scope_cannot_carry_baseline() {
        let (fake, d) = setup();
        let book = live_book(&fake, &d);
        let op = Operation::new("s", "add_sheet", json!({"title": "New"})).with_baseline("r1");
        let op = normalize(&op).unwrap();
        let err = smol::block_on(check(&op, &book, &d)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
