//! Parameter normalization.
//!
//! Turns an [`Operation`]'s loose JSON parameters into typed, canonical
//! [`Params`]: ranges parsed, tokens uppercased and validated, colors
//! clamped. Everything here is pure; failures are `VALIDATION` (or
//! `UNSUPPORTED_ACTION` for unknown labels) and never reach the network.

use gridrelay_protocol::{Color, Dimension, SheetId, ValueRenderOption};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::{CoreError, Result};
use crate::normalize::{
    normalize_color, normalize_token, token_or, ColorInput, ConditionType, ConflictResolution,
    HorizontalAlignment, NumberFormatType, Preset, ValueInputOption,
};
use crate::operation::{Operation, OperationId, SpreadsheetId, TransactionId};
use crate::range::{parse_a1, A1Range};

/// A sheet addressed by title or by numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Id(SheetId),
    Title(String),
}

/// One written cell, already interpreted per the value input option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellInput {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Formula(String),
}

/// Format attributes shared by format_range, conditional rules and presets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatSpec {
    pub background: Option<Color>,
    pub text_color: Option<Color>,
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    pub horizontal_alignment: Option<HorizontalAlignment>,
    pub number_format: Option<(NumberFormatType, Option<String>)>,
}

impl FormatSpec {
    pub fn is_empty(&self) -> bool {
        *self == FormatSpec::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FindScope {
    Range(A1Range),
    Sheet(SheetRef),
    AllSheets,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRangeParams {
    pub range: A1Range,
    pub render: ValueRenderOption,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMetadataParams {
    pub include_grid_data: bool,
    pub ranges: Vec<A1Range>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRangeParams {
    pub range: A1Range,
    pub values: Vec<Vec<CellInput>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendRowsParams {
    pub sheet: Option<SheetRef>,
    pub values: Vec<Vec<CellInput>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatRangeParams {
    pub range: A1Range,
    pub format: FormatSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindReplaceParams {
    pub find: String,
    pub replacement: String,
    pub scope: FindScope,
    pub match_case: bool,
    pub match_entire_cell: bool,
    pub search_by_regex: bool,
    pub include_formulas: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionParams {
    pub sheet: Option<SheetRef>,
    pub dimension: Dimension,
    pub start: u32,
    pub count: u32,
}

impl DimensionParams {
    /// Exclusive end index. Normalization rejects spans that overflow.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddSheetParams {
    pub title: String,
    pub sheet_id: Option<SheetId>,
    pub index: Option<u32>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateSheetParams {
    pub sheet: SheetRef,
    pub new_title: Option<String>,
    pub new_sheet_id: Option<SheetId>,
    pub insert_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddNamedRangeParams {
    pub name: String,
    pub range: A1Range,
    pub named_range_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalRuleParams {
    pub range: A1Range,
    pub condition: ConditionType,
    pub values: Vec<String>,
    pub format: FormatSpec,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresetParams {
    HeaderRow {
        sheet: Option<SheetRef>,
        rows: u32,
        background: Color,
    },
    BandedRows {
        range: A1Range,
        header_color: Color,
        first_band_color: Color,
        second_band_color: Color,
    },
}

/// Normalized parameters, one variant per action.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    ReadRange(ReadRangeParams),
    GetMetadata(GetMetadataParams),
    WriteRange(WriteRangeParams),
    AppendRows(AppendRowsParams),
    ClearRange(A1Range),
    FormatRange(FormatRangeParams),
    FindReplace(FindReplaceParams),
    InsertDimension { dims: DimensionParams, inherit_from_before: bool },
    DeleteDimension(DimensionParams),
    MoveDimension { dims: DimensionParams, destination: u32 },
    AddSheet(AddSheetParams),
    DeleteSheet(SheetRef),
    DuplicateSheet(DuplicateSheetParams),
    AddNamedRange(AddNamedRangeParams),
    AddConditionalRule(ConditionalRuleParams),
    ApplyPreset(PresetParams),
}

/// What an operation touches, for conflict checks and inverse capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scope<'a> {
    Range(&'a A1Range),
    /// One sheet; `None` is the first sheet.
    Sheet(Option<&'a SheetRef>),
    /// The spreadsheet as a whole (new sheets, all-sheet search).
    Spreadsheet,
}

impl Params {
    pub fn scope(&self) -> Scope<'_> {
        match self {
            Params::ReadRange(p) => Scope::Range(&p.range),
            Params::GetMetadata(_) => Scope::Spreadsheet,
            Params::WriteRange(p) => Scope::Range(&p.range),
            Params::AppendRows(p) => Scope::Sheet(p.sheet.as_ref()),
            Params::ClearRange(range) => Scope::Range(range),
            Params::FormatRange(p) => Scope::Range(&p.range),
            Params::FindReplace(p) => match &p.scope {
                FindScope::Range(range) => Scope::Range(range),
                FindScope::Sheet(sheet) => Scope::Sheet(Some(sheet)),
                FindScope::AllSheets => Scope::Spreadsheet,
            },
            Params::InsertDimension { dims, .. }
            | Params::DeleteDimension(dims)
            | Params::MoveDimension { dims, .. } => Scope::Sheet(dims.sheet.as_ref()),
            Params::AddSheet(_) => Scope::Spreadsheet,
            Params::DeleteSheet(sheet) => Scope::Sheet(Some(sheet)),
            Params::DuplicateSheet(p) => Scope::Sheet(Some(&p.sheet)),
            Params::AddNamedRange(p) => Scope::Range(&p.range),
            Params::AddConditionalRule(p) => Scope::Range(&p.range),
            Params::ApplyPreset(PresetParams::HeaderRow { sheet, .. }) => {
                Scope::Sheet(sheet.as_ref())
            }
            Params::ApplyPreset(PresetParams::BandedRows { range, .. }) => Scope::Range(range),
        }
    }

    /// True when the action rearranges rows, columns or sheets, so later
    /// operations on the same sheet see shifted coordinates.
    pub fn reshapes_sheet(&self) -> bool {
        matches!(
            self,
            Params::AppendRows(_)
                | Params::InsertDimension { .. }
                | Params::DeleteDimension(_)
                | Params::MoveDimension { .. }
                | Params::DeleteSheet(_)
        )
    }
}

/// An operation after normalization. Immutable from here on.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOp {
    pub id: OperationId,
    pub spreadsheet_id: SpreadsheetId,
    pub action: Action,
    pub params: Params,
    pub transaction_id: Option<TransactionId>,
    pub baseline_revision: Option<String>,
    pub resolution: ConflictResolution,
}

/// Normalize an operation.
pub fn normalize(op: &Operation) -> Result<NormalizedOp> {
    let action = Action::from_label(&op.action)?;
    let params = normalize_params(action, &op.params)?;
    let resolution = token_or("resolution", op.resolution.as_deref(), ConflictResolution::Manual)?;
    let baseline_revision = match op.baseline_revision.as_deref().map(str::trim) {
        Some("") => return Err(CoreError::invalid_field("baselineRevision", "must not be empty")),
        Some(rev) if !action.is_mutating() => {
            return Err(CoreError::invalid_field(
                "baselineRevision",
                format!("read actions take no baseline (got '{}')", rev),
            ))
        }
        other => other.map(String::from),
    };

    Ok(NormalizedOp {
        id: op.id.clone(),
        spreadsheet_id: op.spreadsheet_id.clone(),
        action,
        params,
        transaction_id: op.transaction_id.clone(),
        baseline_revision,
        resolution,
    })
}

pub fn normalize_params(action: Action, raw: &serde_json::Value) -> Result<Params> {
    let params = match action {
        Action::ReadRange => {
            let raw: RawReadRange = decode(raw)?;
            let render = token_or(
                "params.value_render",
                raw.value_render.as_deref(),
                ValueRenderOption::FormattedValue,
            )?;
            let range = parse_a1("params.range", &raw.range)?;
            Params::ReadRange(ReadRangeParams { range, render })
        }
        Action::GetMetadata => {
            let raw: RawGetMetadata = decode(raw)?;
            let ranges = raw
                .ranges
                .iter()
                .enumerate()
                .map(|(i, r)| parse_a1(&format!("params.ranges[{}]", i), r))
                .collect::<Result<Vec<_>>>()?;
            Params::GetMetadata(GetMetadataParams {
                include_grid_data: raw.include_grid_data,
                ranges,
            })
        }
        Action::WriteRange => {
            let raw: RawWriteRange = decode(raw)?;
            let range = parse_a1("params.range", &raw.range)?;
            let input = value_input(raw.value_input.as_deref())?;
            let values = cell_grid(&raw.values, input)?;
            check_fits(&range, &values)?;
            Params::WriteRange(WriteRangeParams { range, values })
        }
        Action::AppendRows => {
            let raw: RawAppendRows = decode(raw)?;
            let input = value_input(raw.value_input.as_deref())?;
            let values = cell_grid(&raw.values, input)?;
            Params::AppendRows(AppendRowsParams { sheet: raw.sheet, values })
        }
        Action::ClearRange => {
            let raw: RawRange = decode(raw)?;
            Params::ClearRange(parse_a1("params.range", &raw.range)?)
        }
        Action::FormatRange => {
            let raw: RawFormatRange = decode(raw)?;
            let format = raw.format.normalize("params")?;
            if format.is_empty() {
                return Err(CoreError::invalid_field("params", "no format attribute given"));
            }
            let range = parse_a1("params.range", &raw.range)?;
            Params::FormatRange(FormatRangeParams { range, format })
        }
        Action::FindReplace => {
            let raw: RawFindReplace = decode(raw)?;
            if raw.find.is_empty() {
                return Err(CoreError::invalid_field("params.find", "must not be empty"));
            }
            let scope = match (raw.range, raw.sheet) {
                (Some(_), Some(_)) => {
                    return Err(CoreError::invalid_field(
                        "params",
                        "give either range or sheet, not both",
                    ))
                }
                (Some(range), None) => FindScope::Range(parse_a1("params.range", &range)?),
                (None, Some(sheet)) => FindScope::Sheet(sheet),
                (None, None) => FindScope::AllSheets,
            };
            Params::FindReplace(FindReplaceParams {
                find: raw.find,
                replacement: raw.replacement,
                scope,
                match_case: raw.match_case,
                match_entire_cell: raw.match_entire_cell,
                search_by_regex: raw.search_by_regex,
                include_formulas: raw.include_formulas,
            })
        }
        Action::InsertDimension => {
            let raw: RawInsertDimension = decode(raw)?;
            let dims = raw.dims.normalize()?;
            if raw.inherit_from_before && dims.start == 0 {
                return Err(CoreError::invalid_field(
                    "params.inherit_from_before",
                    "cannot inherit from before the first row or column",
                ));
            }
            Params::InsertDimension { dims, inherit_from_before: raw.inherit_from_before }
        }
        Action::DeleteDimension => {
            let raw: RawDimension = decode(raw)?;
            Params::DeleteDimension(raw.normalize()?)
        }
        Action::MoveDimension => {
            let raw: RawMoveDimension = decode(raw)?;
            let dims = raw.dims.normalize()?;
            let end = dims.end();
            if (dims.start..=end).contains(&raw.destination) {
                return Err(CoreError::invalid_field(
                    "params.destination",
                    format!(
                        "destination {} lies inside the moved span {}..{}",
                        raw.destination, dims.start, end
                    ),
                ));
            }
            Params::MoveDimension { dims, destination: raw.destination }
        }
        Action::AddSheet => {
            let raw: RawAddSheet = decode(raw)?;
            let title = raw.title.trim().to_string();
            if title.is_empty() {
                return Err(CoreError::invalid_field("params.title", "must not be empty"));
            }
            Params::AddSheet(AddSheetParams {
                title,
                sheet_id: raw.sheet_id,
                index: raw.index,
                rows: raw.rows,
                columns: raw.columns,
            })
        }
        Action::DeleteSheet => {
            let raw: RawSheet = decode(raw)?;
            Params::DeleteSheet(raw.sheet)
        }
        Action::DuplicateSheet => {
            let raw: RawDuplicateSheet = decode(raw)?;
            Params::DuplicateSheet(DuplicateSheetParams {
                sheet: raw.sheet,
                new_title: raw.new_title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
                new_sheet_id: raw.new_sheet_id,
                insert_index: raw.insert_index,
            })
        }
        Action::AddNamedRange => {
            let raw: RawNamedRange = decode(raw)?;
            check_range_name(&raw.name)?;
            Params::AddNamedRange(AddNamedRangeParams {
                name: raw.name,
                range: parse_a1("params.range", &raw.range)?,
                named_range_id: raw.named_range_id,
            })
        }
        Action::AddConditionalRule => {
            let raw: RawConditionalRule = decode(raw)?;
            let condition: ConditionType = normalize_token("params.condition", &raw.condition)?;
            if raw.values.len() != condition.arity() {
                return Err(CoreError::invalid_field(
                    "params.values",
                    format!(
                        "condition takes {} value(s), got {}",
                        condition.arity(),
                        raw.values.len()
                    ),
                ));
            }
            let format = raw.format.normalize("params")?;
            if format.is_empty() {
                return Err(CoreError::invalid_field(
                    "params",
                    "rule needs at least one format attribute",
                ));
            }
            Params::AddConditionalRule(ConditionalRuleParams {
                range: parse_a1("params.range", &raw.range)?,
                condition,
                values: raw.values,
                format,
                index: raw.index,
            })
        }
        Action::ApplyPreset => {
            let raw: RawPreset = decode(raw)?;
            let preset: Preset = normalize_token("params.preset", &raw.preset)?;
            let color = |field: &str, input: &Option<ColorInput>, default: Color| -> Result<Color> {
                match input {
                    Some(c) => normalize_color(field, c),
                    None => Ok(default),
                }
            };
            match preset {
                Preset::HeaderRow => {
                    let rows = raw.rows.unwrap_or(1);
                    if rows == 0 {
                        return Err(CoreError::invalid_field("params.rows", "must be at least 1"));
                    }
                    Params::ApplyPreset(PresetParams::HeaderRow {
                        sheet: raw.sheet,
                        rows,
                        background: color("params.background", &raw.background, HEADER_GRAY)?,
                    })
                }
                Preset::BandedRows => {
                    let range = raw.range.as_deref().ok_or_else(|| {
                        CoreError::invalid_field("params.range", "required for BANDED_ROWS")
                    })?;
                    Params::ApplyPreset(PresetParams::BandedRows {
                        range: parse_a1("params.range", range)?,
                        header_color: color("params.header_color", &raw.header_color, HEADER_GRAY)?,
                        first_band_color: color(
                            "params.first_band_color",
                            &raw.first_band_color,
                            WHITE,
                        )?,
                        second_band_color: color(
                            "params.second_band_color",
                            &raw.second_band_color,
                            BAND_BLUE,
                        )?,
                    })
                }
            }
        }
    };
    Ok(params)
}

pub const HEADER_GRAY: Color = Color { red: 0.9, green: 0.9, blue: 0.9 };
pub const WHITE: Color = Color { red: 1.0, green: 1.0, blue: 1.0 };
pub const BAND_BLUE: Color = Color { red: 0.9098, green: 0.9412, blue: 0.9961 };

// ── Internal helpers ────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(raw: &serde_json::Value) -> Result<T> {
    let raw = if raw.is_null() { serde_json::json!({}) } else { raw.clone() };
    serde_json::from_value(raw).map_err(|e| CoreError::invalid_field("params", e.to_string()))
}

fn value_input(raw: Option<&str>) -> Result<ValueInputOption> {
    token_or("params.value_input", raw, ValueInputOption::UserEntered)
}

fn cell_grid(
    raw: &[Vec<serde_json::Value>],
    input: ValueInputOption,
) -> Result<Vec<Vec<CellInput>>> {
    if raw.is_empty() {
        return Err(CoreError::invalid_field("params.values", "must contain at least one row"));
    }
    raw.iter()
        .enumerate()
        .map(|(r, row)| {
            row.iter()
                .enumerate()
                .map(|(c, v)| cell_input(&format!("params.values[{}][{}]", r, c), v, input))
                .collect()
        })
        .collect()
}

fn cell_input(field: &str, v: &serde_json::Value, input: ValueInputOption) -> Result<CellInput> {
    use serde_json::Value;
    Ok(match v {
        Value::Null => CellInput::Empty,
        Value::Bool(b) => CellInput::Bool(*b),
        Value::Number(n) => CellInput::Number(
            n.as_f64().ok_or_else(|| CoreError::invalid_field(field, "number out of range"))?,
        ),
        Value::String(s) if s.is_empty() => CellInput::Empty,
        Value::String(s) => match input {
            ValueInputOption::Raw => CellInput::Text(s.clone()),
            ValueInputOption::UserEntered => user_entered(s),
        },
        Value::Array(_) | Value::Object(_) => {
            return Err(CoreError::invalid_field(field, "cells must be scalars"))
        }
    })
}

fn user_entered(s: &str) -> CellInput {
    if s.starts_with('=') {
        return CellInput::Formula(s.to_string());
    }
    if s.eq_ignore_ascii_case("true") {
        return CellInput::Bool(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return CellInput::Bool(false);
    }
    match s.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => CellInput::Number(n),
        _ => CellInput::Text(s.to_string()),
    }
}

fn check_fits(range: &A1Range, values: &[Vec<CellInput>]) -> Result<()> {
    if let Some(rows) = range.row_count() {
        if values.len() > rows as usize {
            return Err(CoreError::invalid_field(
                "params.values",
                format!("{} rows do not fit in {} ({} rows)", values.len(), range, rows),
            ));
        }
    }
    if let Some(cols) = range.col_count() {
        if let Some(widest) = values.iter().map(Vec::len).max() {
            if widest > cols as usize {
                return Err(CoreError::invalid_field(
                    "params.values",
                    format!("{} columns do not fit in {} ({} columns)", widest, range, cols),
                ));
            }
        }
    }
    Ok(())
}

fn check_range_name(name: &str) -> Result<()> {
    let valid_chars = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    let starts_ok = name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_');
    let looks_like_cell = parse_a1("name", name).map_or(false, |r| !r.is_whole_sheet());
    if name.is_empty() || !valid_chars || !starts_ok || looks_like_cell {
        return Err(CoreError::invalid_field(
            "params.name",
            format!("'{}' is not a valid range name", name),
        ));
    }
    Ok(())
}

// ── Raw (wire) parameter shapes ─────────────────────────────────────

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReadRange {
    range: String,
    #[serde(default)]
    value_render: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGetMetadata {
    #[serde(default)]
    include_grid_data: bool,
    #[serde(default)]
    ranges: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWriteRange {
    range: String,
    values: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    value_input: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAppendRows {
    #[serde(default)]
    sheet: Option<SheetRef>,
    values: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    value_input: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRange {
    range: String,
}

#[derive(Deserialize, Default)]
struct RawFormat {
    #[serde(default)]
    background: Option<ColorInput>,
    #[serde(default)]
    text_color: Option<ColorInput>,
    #[serde(default)]
    bold: Option<bool>,
    #[serde(default)]
    italic: Option<bool>,
    #[serde(default)]
    horizontal_alignment: Option<String>,
    #[serde(default)]
    number_format: Option<RawNumberFormat>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNumberFormat {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    pattern: Option<String>,
}

impl RawFormat {
    fn normalize(self, prefix: &str) -> Result<FormatSpec> {
        let field = |name: &str| format!("{}.{}", prefix, name);
        Ok(FormatSpec {
            background: self
                .background
                .as_ref()
                .map(|c| normalize_color(&field("background"), c))
                .transpose()?,
            text_color: self
                .text_color
                .as_ref()
                .map(|c| normalize_color(&field("text_color"), c))
                .transpose()?,
            bold: self.bold,
            italic: self.italic,
            horizontal_alignment: self
                .horizontal_alignment
                .as_deref()
                .map(|a| normalize_token(&field("horizontal_alignment"), a))
                .transpose()?,
            number_format: match self.number_format {
                Some(nf) => Some((
                    normalize_token(&field("number_format.type"), &nf.kind)?,
                    nf.pattern.filter(|p| !p.is_empty()),
                )),
                None => None,
            },
        })
    }
}

#[derive(Deserialize)]
struct RawFormatRange {
    range: String,
    #[serde(flatten)]
    format: RawFormat,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFindReplace {
    find: String,
    #[serde(default)]
    replacement: String,
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    sheet: Option<SheetRef>,
    #[serde(default)]
    match_case: bool,
    #[serde(default)]
    match_entire_cell: bool,
    #[serde(default)]
    search_by_regex: bool,
    #[serde(default)]
    include_formulas: bool,
}

#[derive(Deserialize)]
struct RawDimension {
    #[serde(default)]
    sheet: Option<SheetRef>,
    dimension: String,
    start: u32,
    count: u32,
}

impl RawDimension {
    fn normalize(self) -> Result<DimensionParams> {
        if self.count == 0 {
            return Err(CoreError::invalid_field("params.count", "must be at least 1"));
        }
        if self.start.checked_add(self.count).is_none() {
            return Err(CoreError::invalid_field(
                "params.start",
                format!("span {} + {} is past the last addressable index", self.start, self.count),
            ));
        }
        Ok(DimensionParams {
            sheet: self.sheet,
            dimension: normalize_token("params.dimension", &self.dimension)?,
            start: self.start,
            count: self.count,
        })
    }
}

#[derive(Deserialize)]
struct RawInsertDimension {
    #[serde(flatten)]
    dims: RawDimension,
    #[serde(default)]
    inherit_from_before: bool,
}

#[derive(Deserialize)]
struct RawMoveDimension {
    #[serde(flatten)]
    dims: RawDimension,
    destination: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAddSheet {
    title: String,
    #[serde(default)]
    sheet_id: Option<SheetId>,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    columns: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSheet {
    sheet: SheetRef,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDuplicateSheet {
    sheet: SheetRef,
    #[serde(default)]
    new_title: Option<String>,
    #[serde(default)]
    new_sheet_id: Option<SheetId>,
    #[serde(default)]
    insert_index: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNamedRange {
    name: String,
    range: String,
    #[serde(default)]
    named_range_id: Option<String>,
}

#[derive(Deserialize)]
struct RawConditionalRule {
    range: String,
    condition: String,
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    index: u32,
    #[serde(flatten)]
    format: RawFormat,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPreset {
    preset: String,
    #[serde(default)]
    sheet: Option<SheetRef>,
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    background: Option<ColorInput>,
    #[serde(default)]
    header_color: Option<ColorInput>,
    #[serde(default)]
    first_band_color: Option<ColorInput>,
    #[serde(default)]
    second_band_color: Option<ColorInput>,
}
