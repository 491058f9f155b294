//! gridrelay remote wire format.
//!
//! Typed mirror of the remote spreadsheet API's JSON contract: the atomic
//! `batchUpdate` endpoint (requests and positional replies), the independent
//! values endpoint, and spreadsheet metadata with optional grid data.
//!
//! Field names follow the remote API (camelCase). Optional fields are omitted
//! when unset so that serialized requests are byte-stable: the same request
//! value always produces the same bytes, which the batch size accounting and
//! the compiler's determinism guarantee depend on.
//!
//! # Usage
//!
//! ```ignore
//! use gridrelay_protocol::{BatchUpdateRequest, Request, DeleteSheetRequest};
//!
//! let body = BatchUpdateRequest {
//!     requests: vec![Request::DeleteSheet(DeleteSheetRequest { sheet_id: 7 })],
//! };
//! let json = serde_json::to_string(&body)?;
//! ```

use serde::{Deserialize, Serialize};

mod api;

pub use api::{RemoteError, RemoteErrorKind, SheetsApi, SpreadsheetQuery};

/// Hard ceiling on the serialized size of one batchUpdate body.
pub const BATCH_LIMIT_BYTES: usize = 9_000_000;

/// Remote sheet identifier (stable across renames).
pub type SheetId = i64;

// =============================================================================
// Addressing
// =============================================================================

/// Structural range on one sheet. Indices are zero-based, end-exclusive.
/// Unset bounds mean "unbounded" in that direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridRange {
    pub sheet_id: SheetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_row_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_row_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_column_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column_index: Option<u32>,
}

impl GridRange {
    /// Fully bounded range.
    pub fn bounded(
        sheet_id: SheetId,
        start_row: u32,
        end_row: u32,
        start_col: u32,
        end_col: u32,
    ) -> Self {
        Self {
            sheet_id,
            start_row_index: Some(start_row),
            end_row_index: Some(end_row),
            start_column_index: Some(start_col),
            end_column_index: Some(end_col),
        }
    }

    /// Resolve unbounded edges against a grid size.
    /// Returns (start_row, end_row, start_col, end_col).
    pub fn clamp_to(&self, row_count: u32, column_count: u32) -> (u32, u32, u32, u32) {
        let sr = self.start_row_index.unwrap_or(0).min(row_count);
        let er = self.end_row_index.unwrap_or(row_count).min(row_count).max(sr);
        let sc = self.start_column_index.unwrap_or(0).min(column_count);
        let ec = self.end_column_index.unwrap_or(column_count).min(column_count).max(sc);
        (sr, er, sc, ec)
    }
}

/// Row or column axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    Rows,
    Columns,
}

/// Contiguous span of rows or columns on one sheet. End-exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionRange {
    pub sheet_id: SheetId,
    pub dimension: Dimension,
    pub start_index: u32,
    pub end_index: u32,
}

impl DimensionRange {
    pub fn len(&self) -> u32 {
        self.end_index.saturating_sub(self.start_index)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Cell data
// =============================================================================

/// RGB color, each channel in [0, 1]. Missing channels read as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Color {
    #[serde(default)]
    pub red: f64,
    #[serde(default)]
    pub green: f64,
    #[serde(default)]
    pub blue: f64,
}

/// A typed cell input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtendedValue {
    NumberValue(f64),
    StringValue(String),
    BoolValue(bool),
    FormulaValue(String),
}

impl ExtendedValue {
    /// Plain JSON rendering used by the values endpoint.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ExtendedValue::NumberValue(n) => serde_json::json!(n),
            ExtendedValue::StringValue(s) | ExtendedValue::FormulaValue(s) => serde_json::json!(s),
            ExtendedValue::BoolValue(b) => serde_json::json!(b),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberFormat {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_format: Option<TextFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_alignment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<NumberFormat>,
}

impl CellFormat {
    pub fn is_empty(&self) -> bool {
        self.background_color.is_none()
            && self.text_format.as_ref().map_or(true, |t| *t == TextFormat::default())
            && self.horizontal_alignment.is_none()
            && self.number_format.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_entered_value: Option<ExtendedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_entered_format: Option<CellFormat>,
    /// Display string; only present on reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_value: Option<String>,
}

impl CellData {
    pub fn is_empty(&self) -> bool {
        self.user_entered_value.is_none()
            && self.user_entered_format.as_ref().map_or(true, CellFormat::is_empty)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<CellData>,
}

// =============================================================================
// Sheet-level objects
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_row_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<SheetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_properties: Option<GridProperties>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_range_id: Option<String>,
    pub name: String,
    pub range: GridRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionValue {
    pub user_entered_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanCondition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ConditionValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanRule {
    pub condition: BooleanCondition,
    pub format: CellFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalFormatRule {
    pub ranges: Vec<GridRange>,
    pub boolean_rule: BooleanRule,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandingProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_band_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_band_color: Option<Color>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandedRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banded_range_id: Option<i64>,
    pub range: GridRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_properties: Option<BandingProperties>,
}

// =============================================================================
// batchUpdate requests
// =============================================================================

/// One native request inside a batchUpdate body.
///
/// Externally tagged: `{"updateCells": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    UpdateCells(UpdateCellsRequest),
    AppendCells(AppendCellsRequest),
    RepeatCell(RepeatCellRequest),
    InsertDimension(InsertDimensionRequest),
    DeleteDimension(DeleteDimensionRequest),
    MoveDimension(MoveDimensionRequest),
    AddSheet(AddSheetRequest),
    DeleteSheet(DeleteSheetRequest),
    DuplicateSheet(DuplicateSheetRequest),
    FindReplace(FindReplaceRequest),
    AddConditionalFormatRule(AddConditionalFormatRuleRequest),
    DeleteConditionalFormatRule(DeleteConditionalFormatRuleRequest),
    AddNamedRange(AddNamedRangeRequest),
    DeleteNamedRange(DeleteNamedRangeRequest),
    UpdateSheetProperties(UpdateSheetPropertiesRequest),
    AddBanding(AddBandingRequest),
    DeleteBanding(DeleteBandingRequest),
    AutoResizeDimensions(AutoResizeDimensionsRequest),
}

impl Request {
    /// The wire tag of this request (e.g. "updateCells").
    pub fn kind(&self) -> &'static str {
        match self {
            Request::UpdateCells(_) => "updateCells",
            Request::AppendCells(_) => "appendCells",
            Request::RepeatCell(_) => "repeatCell",
            Request::InsertDimension(_) => "insertDimension",
            Request::DeleteDimension(_) => "deleteDimension",
            Request::MoveDimension(_) => "moveDimension",
            Request::AddSheet(_) => "addSheet",
            Request::DeleteSheet(_) => "deleteSheet",
            Request::DuplicateSheet(_) => "duplicateSheet",
            Request::FindReplace(_) => "findReplace",
            Request::AddConditionalFormatRule(_) => "addConditionalFormatRule",
            Request::DeleteConditionalFormatRule(_) => "deleteConditionalFormatRule",
            Request::AddNamedRange(_) => "addNamedRange",
            Request::DeleteNamedRange(_) => "deleteNamedRange",
            Request::UpdateSheetProperties(_) => "updateSheetProperties",
            Request::AddBanding(_) => "addBanding",
            Request::DeleteBanding(_) => "deleteBanding",
            Request::AutoResizeDimensions(_) => "autoResizeDimensions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCellsRequest {
    #[serde(default)]
    pub rows: Vec<RowData>,
    /// Field mask, e.g. "userEnteredValue".
    pub fields: String,
    pub range: GridRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendCellsRequest {
    pub sheet_id: SheetId,
    pub rows: Vec<RowData>,
    pub fields: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatCellRequest {
    pub range: GridRange,
    pub cell: CellData,
    pub fields: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertDimensionRequest {
    pub range: DimensionRange,
    #[serde(default)]
    pub inherit_from_before: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDimensionRequest {
    pub range: DimensionRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDimensionRequest {
    pub source: DimensionRange,
    pub destination_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddSheetRequest {
    pub properties: SheetProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSheetRequest {
    pub sheet_id: SheetId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSheetRequest {
    pub source_sheet_id: SheetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_sheet_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_sheet_id: Option<SheetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_sheet_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindReplaceRequest {
    pub find: String,
    pub replacement: String,
    #[serde(default)]
    pub match_case: bool,
    #[serde(default)]
    pub match_entire_cell: bool,
    #[serde(default)]
    pub search_by_regex: bool,
    #[serde(default)]
    pub include_formulas: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<GridRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<SheetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_sheets: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddConditionalFormatRuleRequest {
    pub rule: ConditionalFormatRule,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConditionalFormatRuleRequest {
    pub sheet_id: SheetId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNamedRangeRequest {
    pub named_range: NamedRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNamedRangeRequest {
    pub named_range_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSheetPropertiesRequest {
    pub properties: SheetProperties,
    pub fields: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBandingRequest {
    pub banded_range: BandedRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBandingRequest {
    pub banded_range_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoResizeDimensionsRequest {
    pub dimensions: DimensionRange,
}

/// Body of `POST spreadsheets/{id}:batchUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateRequest {
    pub requests: Vec<Request>,
}

/// Reply of `batchUpdate`. `replies[i]` answers `requests[i]`; requests
/// without a reply payload get an empty object.
///
/// Replies stay untyped here so the response parser can detect shapes it
/// does not recognize instead of silently dropping fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateResponse {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default)]
    pub replies: Vec<serde_json::Value>,
}

// =============================================================================
// batchUpdate replies (typed shapes)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddSheetReply {
    pub properties: SheetProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateSheetReply {
    pub properties: SheetProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindReplaceReply {
    #[serde(default)]
    pub values_changed: u64,
    #[serde(default)]
    pub formulas_changed: u64,
    #[serde(default)]
    pub rows_changed: u64,
    #[serde(default)]
    pub sheets_changed: u64,
    #[serde(default)]
    pub occurrences_changed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNamedRangeReply {
    pub named_range: NamedRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBandingReply {
    pub banded_range: BandedRange,
}

// =============================================================================
// Values endpoint and metadata
// =============================================================================

/// How the values endpoint renders cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueRenderOption {
    FormattedValue,
    UnformattedValue,
    Formula,
}

impl ValueRenderOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueRenderOption::FormattedValue => "FORMATTED_VALUE",
            ValueRenderOption::UnformattedValue => "UNFORMATTED_VALUE",
            ValueRenderOption::Formula => "FORMULA",
        }
    }
}

/// Reply of `GET spreadsheets/{id}/values/{range}`. Trailing empty rows and
/// columns are trimmed by the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    pub range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_dimension: Option<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridData {
    #[serde(default)]
    pub start_row: u32,
    #[serde(default)]
    pub start_column: u32,
    #[serde(default)]
    pub row_data: Vec<RowData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    pub properties: SheetProperties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<GridData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_formats: Vec<ConditionalFormatRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub banded_ranges: Vec<BandedRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpreadsheetProperties {
    #[serde(default)]
    pub title: String,
}

/// Reply of `GET spreadsheets/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spreadsheet {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default)]
    pub properties: SpreadsheetProperties,
    #[serde(default)]
    pub sheets: Vec<Sheet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub named_ranges: Vec<NamedRange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_externally_tagged() {
        let req = Request::DeleteSheet(DeleteSheetRequest { sheet_id: 42 });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"deleteSheet": {"sheetId": 42}}));
        assert_eq!(req.kind(), "deleteSheet");
    }

    #[test]
    fn test_grid_range_omits_unbounded_edges() {
        let range = GridRange {
            sheet_id: 0,
            start_row_index: Some(0),
            end_row_index: None,
            start_column_index: Some(2),
            end_column_index: Some(3),
        };
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(
            json,
            r#"{"sheetId":0,"startRowIndex":0,"startColumnIndex":2,"endColumnIndex":3}"#
        );
    }

    #[test]
    fn test_grid_range_clamp() {
        let range = GridRange {
            sheet_id: 0,
            start_column_index: Some(1),
            end_column_index: Some(2),
            ..Default::default()
        };
        assert_eq!(range.clamp_to(1000, 26), (0, 1000, 1, 2));

        let past_edge = GridRange::bounded(0, 5, 50, 0, 40);
        assert_eq!(past_edge.clamp_to(10, 26), (5, 10, 0, 26));
    }

    #[test]
    fn test_extended_value_wire_shape() {
        let cell = CellData {
            user_entered_value: Some(ExtendedValue::FormulaValue("=SUM(A1:A3)".into())),
            ..Default::default()
        };
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json, serde_json::json!({"userEnteredValue": {"formulaValue": "=SUM(A1:A3)"}}));
    }

    #[test]
    fn test_cell_with_empty_format_is_empty() {
        let cell = CellData {
            user_entered_format: Some(CellFormat {
                text_format: Some(TextFormat::default()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(cell.is_empty());
    }

    #[test]
    fn test_batch_reply_tolerates_missing_replies() {
        let reply: BatchUpdateResponse =
            serde_json::from_str(r#"{"spreadsheetId":"abc"}"#).unwrap();
        assert_eq!(reply.spreadsheet_id, "abc");
        assert!(reply.replies.is_empty());
    }

    #[test]
    fn test_find_replace_reply_defaults() {
        let reply: FindReplaceReply = serde_json::from_str(r#"{"occurrencesChanged":3}"#).unwrap();
        assert_eq!(reply.occurrences_changed, 3);
        assert_eq!(reply.values_changed, 0);
    }
}
