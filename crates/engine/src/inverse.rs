//! Inverse capture.
//!
//! Before a request is applied, the state it will overwrite is read from
//! the workbook model and stored as a tagged [`Inverse`]. Inverses compose:
//! an operation's inverse is the inverses of its requests in reverse order.

use gridrelay_core::{CoreError, Result};
use gridrelay_protocol::{
    AddBandingRequest, AddConditionalFormatRuleRequest, AddNamedRangeRequest, BandedRange,
    CellData, ConditionalFormatRule, DeleteBandingRequest, DeleteConditionalFormatRuleRequest,
    DeleteDimensionRequest, DeleteNamedRangeRequest, DeleteSheetRequest, Dimension,
    DimensionRange, GridProperties, GridRange, InsertDimensionRequest, MoveDimensionRequest,
    NamedRange, Request, RowData, SheetId, SheetProperties, UpdateCellsRequest,
    UpdateSheetPropertiesRequest,
};
use serde::{Deserialize, Serialize};

use crate::model::{SheetModel, WorkbookModel};

const RESTORE_FIELDS: &str = "userEnteredValue,userEnteredFormat";

/// What it takes to reverse one request, operation or history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inverse {
    /// Nothing to reverse (e.g. column auto-resize).
    Nothing,
    /// Put back values and formats of a rectangle. Cells of `range` not
    /// covered by `rows` were empty.
    RestoreCells { range: GridRange, rows: Vec<RowData> },
    DeleteDimension { range: DimensionRange },
    /// Re-insert deleted rows or columns, then restore their cells.
    InsertAndRestore { range: DimensionRange, cells: GridRange, rows: Vec<RowData> },
    MoveDimension { source: DimensionRange, destination: u32 },
    DeleteSheet { sheet_id: SheetId },
    DeleteNamedRange { named_range_id: String },
    RestoreNamedRange { named_range: NamedRange },
    DeleteConditionalRule { sheet_id: SheetId, index: u32 },
    RestoreConditionalRule { rule: ConditionalFormatRule, index: u32 },
    DeleteBanding { banded_range_id: i64 },
    RestoreBanding { banded_range: BandedRange },
    SetFrozenRows { sheet_id: SheetId, rows: u32 },
    Composite { parts: Vec<Inverse> },
    Irreversible { reason: String },
}

impl Inverse {
    pub fn is_reversible(&self) -> bool {
        match self {
            Inverse::Irreversible { .. } => false,
            Inverse::Composite { parts } => parts.iter().all(Inverse::is_reversible),
            _ => true,
        }
    }

    /// Applying it to state its forward request never touched changes nothing.
    pub fn is_idempotent(&self) -> bool {
        match self {
            Inverse::Nothing | Inverse::RestoreCells { .. } | Inverse::SetFrozenRows { .. } => true,
            Inverse::Composite { parts } => parts.iter().all(Inverse::is_idempotent),
            _ => false,
        }
    }

    /// Compose inverses that must run in the given order.
    pub fn sequence(mut parts: Vec<Inverse>) -> Inverse {
        parts.retain(|p| *p != Inverse::Nothing);
        match parts.len() {
            0 => Inverse::Nothing,
            1 => parts.remove(0),
            _ => Inverse::Composite { parts },
        }
    }

    /// Native requests that carry out this inverse.
    pub fn to_requests(&self) -> Result<Vec<Request>> {
        let mut out = Vec::new();
        self.push_requests(&mut out)?;
        Ok(out)
    }

    fn push_requests(&self, out: &mut Vec<Request>) -> Result<()> {
        match self {
            Inverse::Nothing => {}
            Inverse::RestoreCells { range, rows } => out.push(restore(range, rows)),
            Inverse::DeleteDimension { range } => {
                out.push(Request::DeleteDimension(DeleteDimensionRequest { range: range.clone() }))
            }
            Inverse::InsertAndRestore { range, cells, rows } => {
                out.push(Request::InsertDimension(InsertDimensionRequest {
                    range: range.clone(),
                    inherit_from_before: false,
                }));
                if !rows.is_empty() {
                    out.push(restore(cells, rows));
                }
            }
            Inverse::MoveDimension { source, destination } => {
                out.push(Request::MoveDimension(MoveDimensionRequest {
                    source: source.clone(),
                    destination_index: *destination,
                }))
            }
            Inverse::DeleteSheet { sheet_id } => {
                out.push(Request::DeleteSheet(DeleteSheetRequest { sheet_id: *sheet_id }))
            }
            Inverse::DeleteNamedRange { named_range_id } => out.push(Request::DeleteNamedRange(
                DeleteNamedRangeRequest { named_range_id: named_range_id.clone() },
            )),
            Inverse::RestoreNamedRange { named_range } => {
                out.push(Request::AddNamedRange(AddNamedRangeRequest {
                    named_range: named_range.clone(),
                }))
            }
            Inverse::DeleteConditionalRule { sheet_id, index } => {
                out.push(Request::DeleteConditionalFormatRule(
                    DeleteConditionalFormatRuleRequest { sheet_id: *sheet_id, index: *index },
                ))
            }
            Inverse::RestoreConditionalRule { rule, index } => {
                out.push(Request::AddConditionalFormatRule(AddConditionalFormatRuleRequest {
                    rule: rule.clone(),
                    index: *index,
                }))
            }
            Inverse::DeleteBanding { banded_range_id } => {
                out.push(Request::DeleteBanding(DeleteBandingRequest {
                    banded_range_id: *banded_range_id,
                }))
            }
            Inverse::RestoreBanding { banded_range } => {
                out.push(Request::AddBanding(AddBandingRequest {
                    banded_range: banded_range.clone(),
                }))
            }
            Inverse::SetFrozenRows { sheet_id, rows } => {
                out.push(Request::UpdateSheetProperties(UpdateSheetPropertiesRequest {
                    properties: SheetProperties {
                        sheet_id: Some(*sheet_id),
                        grid_properties: Some(GridProperties {
                            frozen_row_count: Some(*rows),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    fields: "gridProperties.frozenRowCount".into(),
                }))
            }
            Inverse::Composite { parts } => {
                for part in parts {
                    part.push_requests(out)?;
                }
            }
            Inverse::Irreversible { reason } => {
                return Err(CoreError::validation(format!("Cannot be undone: {}", reason)));
            }
        }
        Ok(())
    }
}

/// Inverse of one request, read from the model before it is applied.
pub fn capture(request: &Request, book: &WorkbookModel) -> Result<Inverse> {
    let inverse = match request {
        Request::UpdateCells(req) => snapshot(book.sheet(req.range.sheet_id)?, &req.range),
        Request::RepeatCell(req) => snapshot(book.sheet(req.range.sheet_id)?, &req.range),
        Request::AppendCells(req) => {
            let sheet = book.sheet(req.sheet_id)?;
            let extent = sheet.data_extent();
            let end = extent + req.rows.len() as u32;
            let width = req.rows.iter().map(|r| r.values.len()).max().unwrap_or(0) as u32;
            let mut parts = Vec::new();
            if end > sheet.row_count {
                parts.push(Inverse::DeleteDimension {
                    range: DimensionRange {
                        sheet_id: sheet.sheet_id,
                        dimension: Dimension::Rows,
                        start_index: sheet.row_count,
                        end_index: end,
                    },
                });
            }
            let overwritten = end.min(sheet.row_count);
            if overwritten > extent && width > 0 {
                let range = GridRange::bounded(sheet.sheet_id, extent, overwritten, 0, width);
                parts.push(snapshot(sheet, &range));
            }
            Inverse::sequence(parts)
        }
        Request::InsertDimension(req) => Inverse::DeleteDimension { range: req.range.clone() },
        Request::DeleteDimension(req) => {
            let sheet = book.sheet(req.range.sheet_id)?;
            let (s, e) = (req.range.start_index, req.range.end_index);
            let cells = match req.range.dimension {
                Dimension::Rows => GridRange::bounded(sheet.sheet_id, s, e, 0, sheet.column_count),
                Dimension::Columns => GridRange::bounded(sheet.sheet_id, 0, sheet.row_count, s, e),
            };
            let (cells, rows) = snapshot_cells(sheet, &cells);
            Inverse::InsertAndRestore { range: req.range.clone(), cells, rows }
        }
        Request::MoveDimension(req) => {
            let (s, e, d) = (req.source.start_index, req.source.end_index, req.destination_index);
            let n = e - s;
            let (start, destination) = if d > e { (d - n, s) } else { (d, e) };
            Inverse::MoveDimension {
                source: DimensionRange {
                    start_index: start,
                    end_index: start + n,
                    ..req.source.clone()
                },
                destination,
            }
        }
        Request::AddSheet(req) => match req.properties.sheet_id {
            Some(sheet_id) => Inverse::DeleteSheet { sheet_id },
            None => irreversible("added sheet has no known id"),
        },
        Request::DeleteSheet(_) => irreversible("deleted sheets cannot be restored"),
        Request::DuplicateSheet(req) => match req.new_sheet_id {
            Some(sheet_id) => Inverse::DeleteSheet { sheet_id },
            None => irreversible("duplicated sheet has no known id"),
        },
        Request::FindReplace(req) => match (&req.range, req.sheet_id) {
            (Some(range), _) => snapshot(book.sheet(range.sheet_id)?, range),
            (None, Some(sheet_id)) => {
                let sheet = book.sheet(sheet_id)?;
                snapshot(sheet, &GridRange { sheet_id, ..Default::default() })
            }
            (None, None) => irreversible("find/replace across all sheets"),
        },
        Request::AddConditionalFormatRule(req) => {
            let sheet_id = req.rule.ranges.first().map(|r| r.sheet_id).unwrap_or_default();
            let existing = book.sheet(sheet_id)?.conditional_formats.len() as u32;
            Inverse::DeleteConditionalRule { sheet_id, index: req.index.min(existing) }
        }
        Request::DeleteConditionalFormatRule(req) => {
            let sheet = book.sheet(req.sheet_id)?;
            match sheet.conditional_formats.get(req.index as usize) {
                Some(rule) => {
                    Inverse::RestoreConditionalRule { rule: rule.clone(), index: req.index }
                }
                None => irreversible("no conditional rule at that index"),
            }
        }
        Request::AddNamedRange(req) => match &req.named_range.named_range_id {
            Some(id) => Inverse::DeleteNamedRange { named_range_id: id.clone() },
            None => irreversible("named range has no known id"),
        },
        Request::DeleteNamedRange(req) => {
            let target = req.named_range_id.as_str();
            match book.named_ranges.iter().find(|n| n.named_range_id.as_deref() == Some(target)) {
                Some(named_range) => {
                    Inverse::RestoreNamedRange { named_range: named_range.clone() }
                }
                None => irreversible("unknown named range"),
            }
        }
        Request::UpdateSheetProperties(req) => {
            let sheet_id = req.properties.sheet_id.unwrap_or_default();
            if req.fields.trim() == "gridProperties.frozenRowCount" {
                Inverse::SetFrozenRows { sheet_id, rows: book.sheet(sheet_id)?.frozen_rows }
            } else {
                irreversible("only frozen row changes are reversible")
            }
        }
        Request::AddBanding(req) => match req.banded_range.banded_range_id {
            Some(banded_range_id) => Inverse::DeleteBanding { banded_range_id },
            None => irreversible("banding has no known id"),
        },
        Request::DeleteBanding(req) => book
            .sheets()
            .iter()
            .flat_map(|s| s.banded_ranges.iter())
            .find(|b| b.banded_range_id == Some(req.banded_range_id))
            .map(|b| Inverse::RestoreBanding { banded_range: b.clone() })
            .unwrap_or_else(|| irreversible("unknown banding")),
        Request::AutoResizeDimensions(_) => Inverse::Nothing,
    };
    Ok(inverse)
}

/// Capture and apply a sequence of requests; returns their combined
/// inverse. On error the model is left untouched.
pub fn apply_capturing<'a, I>(book: &mut WorkbookModel, requests: I) -> Result<Inverse>
where
    I: IntoIterator<Item = &'a Request>,
{
    let requests: Vec<&Request> = requests.into_iter().collect();
    if let [request] = requests.as_slice() {
        // A single apply fails before mutating.
        let inverse = capture(request, book)?;
        book.apply(request)?;
        return Ok(inverse);
    }
    let mut scratch = book.clone();
    let mut parts = Vec::with_capacity(requests.len());
    for request in requests {
        parts.push(capture(request, &scratch)?);
        scratch.apply(request)?;
    }
    *book = scratch;
    parts.reverse();
    Ok(Inverse::sequence(parts))
}

// ── Internal helpers ────────────────────────────────────────────────

fn irreversible(reason: &str) -> Inverse {
    Inverse::Irreversible { reason: reason.to_string() }
}

fn restore(range: &GridRange, rows: &[RowData]) -> Request {
    Request::UpdateCells(UpdateCellsRequest {
        rows: rows.to_vec(),
        fields: RESTORE_FIELDS.into(),
        range: range.clone(),
    })
}

fn snapshot(sheet: &SheetModel, range: &GridRange) -> Inverse {
    let (range, rows) = snapshot_cells(sheet, range);
    Inverse::RestoreCells { range, rows }
}

/// Prior cells of a range, clamped to the grid, trailing empties trimmed.
fn snapshot_cells(sheet: &SheetModel, range: &GridRange) -> (GridRange, Vec<RowData>) {
    let (sr, er, sc, ec) = range.clamp_to(sheet.row_count, sheet.column_count);
    let mut rows = sheet.snapshot(sr, er, sc, ec);
    for row in &mut rows {
        while row.values.last().map_or(false, CellData::is_empty) {
            row.values.pop();
        }
    }
    while rows.last().map_or(false, |r| r.values.is_empty()) {
        rows.pop();
    }
    (GridRange::bounded(sheet.sheet_id, sr, er, sc, ec), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrelay_protocol::*;

    fn cell(value: ExtendedValue) -> CellData {
        CellData { user_entered_value: Some(value), ..Default::default() }
    }

    fn span(dimension: Dimension, start_index: u32, end_index: u32) -> DimensionRange {
        DimensionRange { sheet_id: 0, dimension, start_index, end_index }
    }

    fn book() -> WorkbookModel {
        let mut b = WorkbookModel::new("Book").with_sheet(SheetModel::new(0, "Sheet1", 6, 4));
        for r in 0..4 {
            let value = cell(ExtendedValue::NumberValue(r as f64));
            b.sheet_mut(0).unwrap().put_cell(r, 0, value);
        }
        b
    }

    /// Apply forward with capture, then the inverse; the model must match.
    fn assert_round_trip(forward: Vec<Request>) {
        let original = book();
        let mut b = original.clone();
        let inverse = apply_capturing(&mut b, forward.iter()).unwrap();
        assert_ne!(b, original, "forward had no effect");
        b.apply_all(&inverse.to_requests().unwrap()).unwrap();
        assert_eq!(b, original);
    }

    #[test]
    fn test_write_round_trip() {
        assert_round_trip(vec![Request::UpdateCells(UpdateCellsRequest {
            rows: vec![RowData {
                values: vec![
                    cell(ExtendedValue::StringValue("x".into())),
                    cell(ExtendedValue::StringValue("y".into())),
                ],
            }],
            fields: "userEnteredValue".into(),
            range: GridRange::bounded(0, 1, 2, 0, 2),
        })]);
    }

    #[test]
    fn test_append_with_growth_round_trip() {
        let row = RowData { values: vec![cell(ExtendedValue::BoolValue(true))] };
        assert_round_trip(vec![Request::AppendCells(AppendCellsRequest {
            sheet_id: 0,
            rows: vec![row.clone(), row.clone(), row.clone(), row],
            fields: "userEnteredValue".into(),
        })]);
    }

    #[test]
    fn test_delete_rows_round_trip() {
        assert_round_trip(vec![Request::DeleteDimension(DeleteDimensionRequest {
            range: span(Dimension::Rows, 1, 3),
        })]);
    }

    #[test]
    fn test_move_columns_round_trip() {
        let mut original = book();
        let d = cell(ExtendedValue::StringValue("d".into()));
        original.sheet_mut(0).unwrap().put_cell(0, 3, d);
        let mut b = original.clone();
        let forward = Request::MoveDimension(MoveDimensionRequest {
            source: span(Dimension::Columns, 3, 4),
            destination_index: 0,
        });
        let inverse = apply_capturing(&mut b, [&forward]).unwrap();
        b.apply_all(&inverse.to_requests().unwrap()).unwrap();
        assert_eq!(b, original);
    }

    #[test]
    fn test_multi_request_inverse_reversed() {
        assert_round_trip(vec![
            Request::InsertDimension(InsertDimensionRequest {
                range: span(Dimension::Rows, 0, 1),
                inherit_from_before: false,
            }),
            Request::UpdateCells(UpdateCellsRequest {
                rows: vec![RowData {
                    values: vec![CellData {
                        user_entered_value: Some(ExtendedValue::StringValue("hdr".into())),
                        ..Default::default()
                    }],
                }],
                fields: "userEnteredValue".into(),
                range: GridRange::bounded(0, 0, 1, 0, 1),
            }),
        ]);
    }

    #[test]
    fn test_delete_sheet_irreversible() {
        let mut b = book().with_sheet(SheetModel::new(5, "Other", 10, 10));
        let delete = Request::DeleteSheet(DeleteSheetRequest { sheet_id: 5 });
        let inverse = apply_capturing(&mut b, [&delete]).unwrap();
        assert!(!inverse.is_reversible());
        assert!(inverse.to_requests().is_err());
    }

    #[test]
    fn test_failed_sequence_leaves_model() {
        let original = book();
        let mut b = original.clone();
        let requests = vec![
            Request::InsertDimension(InsertDimensionRequest {
                range: span(Dimension::Rows, 0, 1),
                inherit_from_before: false,
            }),
            Request::DeleteSheet(DeleteSheetRequest { sheet_id: 0 }),
        ];
        assert!(apply_capturing(&mut b, requests.iter()).is_err());
        assert_eq!(b, original);
    }
}
