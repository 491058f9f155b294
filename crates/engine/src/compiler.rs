//! Request compiler: one normalized operation to native batchUpdate requests.
//!
//! Compilation is pure. Identifiers the remote would otherwise pick (new
//! sheet ids, named range ids, banding ids) are derived from the operation
//! id, so compiling the same operation twice yields byte-identical requests
//! and inverses can be built before anything is sent.

use gridrelay_core::normalize::token_name;
use gridrelay_core::params::{
    AddNamedRangeParams, AddSheetParams, ConditionalRuleParams, DimensionParams,
    DuplicateSheetParams, FindReplaceParams, PresetParams,
};
use gridrelay_core::{
    CellInput, CoreError, FindScope, FormatSpec, NormalizedOp, OperationId, Params, Result,
};
use gridrelay_protocol::{
    AddBandingRequest, AddConditionalFormatRuleRequest, AddNamedRangeRequest, AddSheetRequest,
    AppendCellsRequest, AutoResizeDimensionsRequest, BandedRange, BandingProperties,
    BooleanCondition, BooleanRule, CellData, CellFormat, ConditionValue, ConditionalFormatRule,
    DeleteDimensionRequest, DeleteSheetRequest, Dimension, DimensionRange, DuplicateSheetRequest,
    ExtendedValue, FindReplaceRequest, GridProperties, GridRange, InsertDimensionRequest,
    MoveDimensionRequest, NamedRange, NumberFormat, RepeatCellRequest, Request, RowData, SheetId,
    SheetProperties, TextFormat, UpdateCellsRequest, UpdateSheetPropertiesRequest,
};

use crate::model::WorkbookModel;
use crate::parser::ReplyExpectation;

/// A native request tagged with the operation it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRequest {
    pub operation_id: OperationId,
    pub request: Request,
    pub expect: ReplyExpectation,
}

/// Compile a mutating operation against the current workbook shape.
///
/// The workbook resolves sheet titles to ids and supplies grid sizes; it is
/// not modified.
pub fn compile(op: &NormalizedOp, book: &WorkbookModel) -> Result<Vec<CompiledRequest>> {
    let tagged = |request: Request, expect: ReplyExpectation| CompiledRequest {
        operation_id: op.id.clone(),
        request,
        expect,
    };

    let requests = match &op.params {
        Params::ReadRange(_) | Params::GetMetadata(_) => {
            return Err(CoreError::validation(format!(
                "{} is a read and does not compile to batch requests",
                op.action.label()
            )))
        }
        Params::WriteRange(p) => {
            let grid = book.grid_range(&p.range)?;
            let (rows, width) = row_data(&p.values);
            let sr = grid.start_row_index.unwrap_or(0);
            let sc = grid.start_column_index.unwrap_or(0);
            let cells = rows.len() as u64 * width as u64;
            let er = sr + rows.len() as u32;
            let range = GridRange::bounded(grid.sheet_id, sr, er, sc, sc + width);
            vec![tagged(
                Request::UpdateCells(UpdateCellsRequest {
                    rows,
                    fields: "userEnteredValue".into(),
                    range,
                }),
                ReplyExpectation::Empty { cells: Some(cells) },
            )]
        }
        Params::AppendRows(p) => {
            let sheet = book.resolve(p.sheet.as_ref())?;
            let (rows, width) = row_data(&p.values);
            let cells = rows.len() as u64 * width as u64;
            vec![tagged(
                Request::AppendCells(AppendCellsRequest {
                    sheet_id: sheet.sheet_id,
                    rows,
                    fields: "userEnteredValue".into(),
                }),
                ReplyExpectation::Empty { cells: Some(cells) },
            )]
        }
        Params::ClearRange(range) => vec![tagged(
            Request::UpdateCells(UpdateCellsRequest {
                rows: Vec::new(),
                fields: "userEnteredValue".into(),
                range: book.grid_range(range)?,
            }),
            ReplyExpectation::empty(),
        )],
        Params::FormatRange(p) => {
            let (cell, fields) = format_cell(&p.format);
            let range = book.grid_range(&p.range)?;
            vec![tagged(
                Request::RepeatCell(RepeatCellRequest { range, cell, fields }),
                ReplyExpectation::empty(),
            )]
        }
        Params::FindReplace(p) => {
            vec![tagged(find_replace(p, book)?, ReplyExpectation::FindReplace)]
        }
        Params::InsertDimension { dims, inherit_from_before } => vec![tagged(
            Request::InsertDimension(InsertDimensionRequest {
                range: dimension_range(dims, book)?,
                inherit_from_before: *inherit_from_before,
            }),
            ReplyExpectation::empty(),
        )],
        Params::DeleteDimension(dims) => vec![tagged(
            Request::DeleteDimension(DeleteDimensionRequest {
                range: dimension_range(dims, book)?,
            }),
            ReplyExpectation::empty(),
        )],
        Params::MoveDimension { dims, destination } => vec![tagged(
            Request::MoveDimension(MoveDimensionRequest {
                source: dimension_range(dims, book)?,
                destination_index: *destination,
            }),
            ReplyExpectation::empty(),
        )],
        Params::AddSheet(p) => vec![tagged(add_sheet(p, &op.id), ReplyExpectation::AddSheet)],
        Params::DeleteSheet(sheet) => vec![tagged(
            Request::DeleteSheet(DeleteSheetRequest {
                sheet_id: book.resolve(Some(sheet))?.sheet_id,
            }),
            ReplyExpectation::empty(),
        )],
        Params::DuplicateSheet(p) => {
            vec![tagged(duplicate_sheet(p, &op.id, book)?, ReplyExpectation::DuplicateSheet)]
        }
        Params::AddNamedRange(p) => {
            vec![tagged(add_named_range(p, &op.id, book)?, ReplyExpectation::AddNamedRange)]
        }
        Params::AddConditionalRule(p) => {
            vec![tagged(conditional_rule(p, book)?, ReplyExpectation::empty())]
        }
        Params::ApplyPreset(PresetParams::HeaderRow { sheet, rows, background }) => {
            let sheet = book.resolve(sheet.as_ref())?;
            let format = FormatSpec {
                background: Some(*background),
                bold: Some(true),
                ..Default::default()
            };
            let (cell, fields) = format_cell(&format);
            vec![
                tagged(
                    Request::RepeatCell(RepeatCellRequest {
                        range: GridRange {
                            sheet_id: sheet.sheet_id,
                            start_row_index: Some(0),
                            end_row_index: Some(*rows),
                            ..Default::default()
                        },
                        cell,
                        fields,
                    }),
                    ReplyExpectation::empty(),
                ),
                tagged(
                    Request::UpdateSheetProperties(UpdateSheetPropertiesRequest {
                        properties: SheetProperties {
                            sheet_id: Some(sheet.sheet_id),
                            grid_properties: Some(GridProperties {
                                frozen_row_count: Some(*rows),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        fields: "gridProperties.frozenRowCount".into(),
                    }),
                    ReplyExpectation::empty(),
                ),
                tagged(
                    Request::AutoResizeDimensions(AutoResizeDimensionsRequest {
                        dimensions: DimensionRange {
                            sheet_id: sheet.sheet_id,
                            dimension: Dimension::Columns,
                            start_index: 0,
                            end_index: sheet.column_count,
                        },
                    }),
                    ReplyExpectation::empty(),
                ),
            ]
        }
        Params::ApplyPreset(PresetParams::BandedRows {
            range,
            header_color,
            first_band_color,
            second_band_color,
        }) => {
            vec![tagged(
                Request::AddBanding(AddBandingRequest {
                    banded_range: BandedRange {
                        banded_range_id: Some(derived_id(&op.id, "banding")),
                        range: book.grid_range(range)?,
                        row_properties: Some(BandingProperties {
                            header_color: Some(*header_color),
                            first_band_color: Some(*first_band_color),
                            second_band_color: Some(*second_band_color),
                        }),
                    },
                }),
                ReplyExpectation::AddBanding,
            )]
        }
    };
    Ok(requests)
}

/// Positive 31-bit id derived from an operation id.
pub fn derived_id(op: &OperationId, salt: &str) -> SheetId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(op.as_str().as_bytes());
    hasher.update(b"/");
    hasher.update(salt.as_bytes());
    let hash = hasher.finalize();
    let bytes = hash.as_bytes();
    let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    // Zero is the conventional id of the first sheet.
    ((raw & 0x7fff_ffff).max(1)) as SheetId
}

/// Cell data and field mask for a format spec.
pub fn format_cell(spec: &FormatSpec) -> (CellData, String) {
    let mut format = CellFormat::default();
    let mut text = TextFormat::default();
    let mut fields = Vec::new();
    if let Some(color) = spec.background {
        format.background_color = Some(color);
        fields.push("userEnteredFormat.backgroundColor");
    }
    if let Some(color) = spec.text_color {
        text.foreground_color = Some(color);
        fields.push("userEnteredFormat.textFormat.foregroundColor");
    }
    if let Some(bold) = spec.bold {
        text.bold = Some(bold);
        fields.push("userEnteredFormat.textFormat.bold");
    }
    if let Some(italic) = spec.italic {
        text.italic = Some(italic);
        fields.push("userEnteredFormat.textFormat.italic");
    }
    if let Some(align) = spec.horizontal_alignment {
        format.horizontal_alignment = Some(token_name(align).to_string());
        fields.push("userEnteredFormat.horizontalAlignment");
    }
    if let Some((kind, pattern)) = &spec.number_format {
        format.number_format = Some(NumberFormat {
            kind: token_name(*kind).to_string(),
            pattern: pattern.clone(),
        });
        fields.push("userEnteredFormat.numberFormat");
    }
    if text != TextFormat::default() {
        format.text_format = Some(text);
    }
    let cell = CellData { user_entered_format: Some(format), ..Default::default() };
    (cell, fields.join(","))
}

// ── Internal helpers ────────────────────────────────────────────────

/// Rows padded to a common width, and that width.
fn row_data(values: &[Vec<CellInput>]) -> (Vec<RowData>, u32) {
    let width = values.iter().map(Vec::len).max().unwrap_or(0);
    let rows = values
        .iter()
        .map(|row| RowData {
            values: (0..width).map(|c| row.get(c).map(cell_data).unwrap_or_default()).collect(),
        })
        .collect();
    (rows, width as u32)
}

fn cell_data(input: &CellInput) -> CellData {
    let value = match input {
        CellInput::Empty => None,
        CellInput::Number(n) => Some(ExtendedValue::NumberValue(*n)),
        CellInput::Text(s) => Some(ExtendedValue::StringValue(s.clone())),
        CellInput::Bool(b) => Some(ExtendedValue::BoolValue(*b)),
        CellInput::Formula(f) => Some(ExtendedValue::FormulaValue(f.clone())),
    };
    CellData { user_entered_value: value, ..Default::default() }
}

fn dimension_range(dims: &DimensionParams, book: &WorkbookModel) -> Result<DimensionRange> {
    let sheet = book.resolve(dims.sheet.as_ref())?;
    Ok(DimensionRange {
        sheet_id: sheet.sheet_id,
        dimension: dims.dimension,
        start_index: dims.start,
        end_index: dims.end(),
    })
}

fn find_replace(p: &FindReplaceParams, book: &WorkbookModel) -> Result<Request> {
    let (range, sheet_id, all_sheets) = match &p.scope {
        FindScope::Range(range) => (Some(book.grid_range(range)?), None, None),
        FindScope::Sheet(sheet) => (None, Some(book.resolve(Some(sheet))?.sheet_id), None),
        FindScope::AllSheets => (None, None, Some(true)),
    };
    Ok(Request::FindReplace(FindReplaceRequest {
        find: p.find.clone(),
        replacement: p.replacement.clone(),
        match_case: p.match_case,
        match_entire_cell: p.match_entire_cell,
        search_by_regex: p.search_by_regex,
        include_formulas: p.include_formulas,
        range,
        sheet_id,
        all_sheets,
    }))
}

fn add_sheet(p: &AddSheetParams, op: &OperationId) -> Request {
    let grid = (p.rows.is_some() || p.columns.is_some()).then(|| GridProperties {
        row_count: p.rows,
        column_count: p.columns,
        frozen_row_count: None,
    });
    Request::AddSheet(AddSheetRequest {
        properties: SheetProperties {
            sheet_id: Some(p.sheet_id.unwrap_or_else(|| derived_id(op, "sheet"))),
            title: Some(p.title.clone()),
            index: p.index,
            grid_properties: grid,
        },
    })
}

fn duplicate_sheet(
    p: &DuplicateSheetParams,
    op: &OperationId,
    book: &WorkbookModel,
) -> Result<Request> {
    let source = book.resolve(Some(&p.sheet))?;
    Ok(Request::DuplicateSheet(DuplicateSheetRequest {
        source_sheet_id: source.sheet_id,
        insert_sheet_index: p.insert_index,
        new_sheet_id: Some(p.new_sheet_id.unwrap_or_else(|| derived_id(op, "sheet"))),
        new_sheet_name: p.new_title.clone(),
    }))
}

fn add_named_range(
    p: &AddNamedRangeParams,
    op: &OperationId,
    book: &WorkbookModel,
) -> Result<Request> {
    let id = p
        .named_range_id
        .clone()
        .unwrap_or_else(|| format!("nr{:08x}", derived_id(op, "named_range")));
    Ok(Request::AddNamedRange(AddNamedRangeRequest {
        named_range: NamedRange {
            named_range_id: Some(id),
            name: p.name.clone(),
            range: book.grid_range(&p.range)?,
        },
    }))
}

fn conditional_rule(p: &ConditionalRuleParams, book: &WorkbookModel) -> Result<Request> {
    let (cell, _) = format_cell(&p.format);
    Ok(Request::AddConditionalFormatRule(AddConditionalFormatRuleRequest {
        rule: ConditionalFormatRule {
            ranges: vec![book.grid_range(&p.range)?],
            boolean_rule: BooleanRule {
                condition: BooleanCondition {
                    kind: token_name(p.condition).to_string(),
                    values: p
                        .values
                        .iter()
                        .map(|v| ConditionValue { user_entered_value: v.clone() })
                        .collect(),
                },
                format: cell.user_entered_format.unwrap_or_default(),
            },
        },
        index: p.index,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SheetModel;
    use gridrelay_core::{normalize, ErrorCode, Operation};
    use serde_json::json;

    fn book() -> WorkbookModel {
        WorkbookModel::new("Book")
            .with_sheet(SheetModel::new(0, "Sheet1", 1000, 26))
            .with_sheet(SheetModel::new(42, "Data", 100, 10))
    }

    fn compile_op(action: &str, params: serde_json::Value) -> Result<Vec<CompiledRequest>> {
        let op = normalize(&Operation::new("s1", action, params).with_id("op-1"))?;
        compile(&op, &book())
    }

    #[test]
    fn test_write_2x2_is_one_update() {
        let params = json!({"range": "A1:B2", "values": [[1, 2], [3, 4]]});
        let out = compile_op("write_range", params).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].expect, ReplyExpectation::Empty { cells: Some(4) });
        let Request::UpdateCells(req) = &out[0].request else { panic!("expected updateCells") };
        assert_eq!(req.range, GridRange::bounded(0, 0, 2, 0, 2));
        assert_eq!(req.fields, "userEnteredValue");
    }

    #[test]
    fn test_write_anchors_at_range_start() {
        let params = json!({"range": "Data!C5:Z100", "values": [["x"]]});
        let out = compile_op("write_range", params).unwrap();
        let Request::UpdateCells(req) = &out[0].request else { panic!("expected updateCells") };
        assert_eq!(req.range, GridRange::bounded(42, 4, 5, 2, 3));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let a = compile_op("add_sheet", json!({"title": "New"})).unwrap();
        let b = compile_op("add_sheet", json!({"title": "New"})).unwrap();
        let bytes = |c: &[CompiledRequest]| serde_json::to_vec(&c[0].request).unwrap();
        assert_eq!(bytes(&a), bytes(&b));
        let Request::AddSheet(req) = &a[0].request else { panic!("expected addSheet") };
        assert!(req.properties.sheet_id.unwrap() > 0);
    }

    #[test]
    fn test_header_preset_expands_to_three_requests() {
        let params = json!({"preset": "header_row", "sheet": "Data"});
        let out = compile_op("apply_preset", params).unwrap();
        let kinds: Vec<_> = out.iter().map(|c| c.request.kind()).collect();
        assert_eq!(kinds, vec!["repeatCell", "updateSheetProperties", "autoResizeDimensions"]);
        assert!(out.iter().all(|c| c.operation_id.as_str() == "op-1"));
    }

    #[test]
    fn test_format_fields_match_set_options() {
        let params = json!({"range": "A1:D1", "bold": true, "background": [1, 0, 0]});
        let out = compile_op("format_range", params).unwrap();
        let Request::RepeatCell(req) = &out[0].request else { panic!("expected repeatCell") };
        assert_eq!(
            req.fields,
            "userEnteredFormat.backgroundColor,userEnteredFormat.textFormat.bold"
        );
    }

    #[test]
    fn test_unknown_sheet_is_not_found() {
        let err = compile_op("clear_range", json!({"range": "Nope!A1"})).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_reads_do_not_compile() {
        let err = compile_op("read_range", json!({"range": "A1"})).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[test]
    fn test_find_replace_all_sheets() {
        let out = compile_op("find_replace", json!({"find": "a", "replacement": "b"})).unwrap();
        let Request::FindReplace(req) = &out[0].request else { panic!("expected findReplace") };
        assert_eq!(req.all_sheets, Some(true));
        assert_eq!(out[0].expect, ReplyExpectation::FindReplace);
    }
}
