//! In-memory workbook model.
//!
//! Applies native requests to a local copy of spreadsheet state with the
//! remote's semantics. The executor replays each commit against a model
//! seeded from a preflight read, which is how inverses are captured before
//! anything is dispatched. The test harness uses the same model as its
//! remote, so what the executor predicts and what the "server" does cannot
//! drift apart.
//!
//! Cells are sparse: a cell with no value and no format is not stored.
//! That keeps state comparisons exact after undo.

use std::collections::{BTreeMap, BTreeSet};

use gridrelay_core::{A1Range, CoreError, Result, SheetRef};
use gridrelay_protocol::{
    BandedRange, CellData, CellFormat, ConditionalFormatRule, Dimension, DimensionRange, GridData,
    GridProperties, GridRange, NamedRange, Request, RowData, Sheet, SheetId, SheetProperties,
    Spreadsheet, SpreadsheetProperties, TextFormat, ValueRenderOption,
};
use serde_json::{json, Value};

pub const DEFAULT_ROWS: u32 = 1000;
pub const DEFAULT_COLUMNS: u32 = 26;

#[derive(Debug, Clone, PartialEq)]
pub struct SheetModel {
    pub sheet_id: SheetId,
    pub title: String,
    pub row_count: u32,
    pub column_count: u32,
    pub frozen_rows: u32,
    cells: BTreeMap<(u32, u32), CellData>,
    pub conditional_formats: Vec<ConditionalFormatRule>,
    pub banded_ranges: Vec<BandedRange>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkbookModel {
    pub title: String,
    sheets: Vec<SheetModel>,
    pub named_ranges: Vec<NamedRange>,
}

impl SheetModel {
    pub fn new(sheet_id: SheetId, title: &str, row_count: u32, column_count: u32) -> Self {
        Self {
            sheet_id,
            title: title.to_string(),
            row_count,
            column_count,
            frozen_rows: 0,
            cells: BTreeMap::new(),
            conditional_formats: Vec::new(),
            banded_ranges: Vec::new(),
        }
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&CellData> {
        self.cells.get(&(row, col))
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Set or clear one cell directly (external edits in tests).
    pub fn put_cell(&mut self, row: u32, col: u32, cell: CellData) {
        let mut cell = cell;
        tidy(&mut cell);
        if cell.is_empty() {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), cell);
        }
    }

    /// One past the last row holding a value.
    pub fn data_extent(&self) -> u32 {
        self.cells
            .iter()
            .filter(|(_, cell)| cell.user_entered_value.is_some())
            .map(|((r, _), _)| r + 1)
            .max()
            .unwrap_or(0)
    }

    /// Every cell of a rectangle, padded with empty cells.
    pub fn snapshot(&self, sr: u32, er: u32, sc: u32, ec: u32) -> Vec<RowData> {
        (sr..er)
            .map(|r| RowData {
                values: (sc..ec).map(|c| self.cell(r, c).cloned().unwrap_or_default()).collect(),
            })
            .collect()
    }

    /// Rendered values with trailing empty rows and columns trimmed.
    pub fn values(
        &self,
        sr: u32,
        er: u32,
        sc: u32,
        ec: u32,
        render: ValueRenderOption,
    ) -> Vec<Vec<Value>> {
        let mut rows: Vec<Vec<Value>> = (sr..er)
            .map(|r| {
                let mut row: Vec<Value> = (sc..ec)
                    .map(|c| {
                        self.cell(r, c)
                            .and_then(|cell| render_value(cell, render))
                            .unwrap_or(json!(""))
                    })
                    .collect();
                while row.last().map_or(false, |v| *v == json!("")) {
                    row.pop();
                }
                row
            })
            .collect();
        while rows.last().map_or(false, Vec::is_empty) {
            rows.pop();
        }
        rows
    }

    pub fn properties(&self, index: u32) -> SheetProperties {
        SheetProperties {
            sheet_id: Some(self.sheet_id),
            title: Some(self.title.clone()),
            index: Some(index),
            grid_properties: Some(GridProperties {
                row_count: Some(self.row_count),
                column_count: Some(self.column_count),
                frozen_row_count: (self.frozen_rows > 0).then_some(self.frozen_rows),
            }),
        }
    }

    fn axis_len(&self, dim: Dimension) -> u32 {
        match dim {
            Dimension::Rows => self.row_count,
            Dimension::Columns => self.column_count,
        }
    }

    fn set_axis_len(&mut self, dim: Dimension, len: u32) {
        match dim {
            Dimension::Rows => self.row_count = len,
            Dimension::Columns => self.column_count = len,
        }
    }

    /// Move every cell along one axis; `None` drops the cell.
    fn remap(&mut self, dim: Dimension, f: impl Fn(u32) -> Option<u32>) {
        let cells = std::mem::take(&mut self.cells);
        for ((r, c), cell) in cells {
            let moved = match dim {
                Dimension::Rows => f(r).map(|r| (r, c)),
                Dimension::Columns => f(c).map(|c| (r, c)),
            };
            if let Some(key) = moved {
                self.cells.insert(key, cell);
            }
        }
    }

    fn merge(&mut self, row: u32, col: u32, source: &CellData, mask: &FieldMask) {
        let mut cell = self.cells.remove(&(row, col)).unwrap_or_default();
        mask.apply(&mut cell, source);
        tidy(&mut cell);
        if !cell.is_empty() {
            self.cells.insert((row, col), cell);
        }
    }

    fn keys_in(&self, sr: u32, er: u32, sc: u32, ec: u32) -> Vec<(u32, u32)> {
        self.cells
            .range((sr, 0)..(er, 0))
            .map(|(k, _)| *k)
            .filter(|(_, c)| *c >= sc && *c < ec)
            .collect()
    }
}

impl WorkbookModel {
    pub fn new(title: &str) -> Self {
        Self { title: title.to_string(), ..Default::default() }
    }

    pub fn with_sheet(mut self, sheet: SheetModel) -> Self {
        self.sheets.push(sheet);
        self
    }

    /// Build from a spreadsheet read, including any grid data it carries.
    pub fn from_spreadsheet(book: &Spreadsheet) -> Self {
        let mut model = WorkbookModel {
            title: book.properties.title.clone(),
            sheets: Vec::with_capacity(book.sheets.len()),
            named_ranges: book.named_ranges.clone(),
        };
        let mut ordered: Vec<&Sheet> = book.sheets.iter().collect();
        ordered.sort_by_key(|s| s.properties.index.unwrap_or(u32::MAX));
        for sheet in ordered {
            let props = &sheet.properties;
            let grid = props.grid_properties.clone().unwrap_or_default();
            let mut sm = SheetModel::new(
                props.sheet_id.unwrap_or(0),
                props.title.as_deref().unwrap_or(""),
                grid.row_count.unwrap_or(DEFAULT_ROWS),
                grid.column_count.unwrap_or(DEFAULT_COLUMNS),
            );
            sm.frozen_rows = grid.frozen_row_count.unwrap_or(0);
            sm.conditional_formats = sheet.conditional_formats.clone();
            sm.banded_ranges = sheet.banded_ranges.clone();
            model.sheets.push(sm);
        }
        model.load_grid(book);
        model
    }

    /// Merge grid data from a read into the matching sheets.
    pub fn load_grid(&mut self, book: &Spreadsheet) {
        for sheet in &book.sheets {
            let Some(target) = sheet.properties.sheet_id.and_then(|id| self.sheet_mut(id).ok())
            else {
                continue;
            };
            for data in &sheet.data {
                for (i, row) in data.row_data.iter().enumerate() {
                    for (j, cell) in row.values.iter().enumerate() {
                        let (r, c) = (data.start_row + i as u32, data.start_column + j as u32);
                        target.put_cell(r, c, cell.clone());
                    }
                }
            }
        }
    }

    pub fn sheets(&self) -> &[SheetModel] {
        &self.sheets
    }

    pub fn sheet(&self, sheet_id: SheetId) -> Result<&SheetModel> {
        self.sheets
            .iter()
            .find(|s| s.sheet_id == sheet_id)
            .ok_or_else(|| CoreError::not_found(format!("No sheet with id {}", sheet_id)))
    }

    pub fn sheet_mut(&mut self, sheet_id: SheetId) -> Result<&mut SheetModel> {
        self.sheets
            .iter_mut()
            .find(|s| s.sheet_id == sheet_id)
            .ok_or_else(|| CoreError::not_found(format!("No sheet with id {}", sheet_id)))
    }

    pub fn sheet_by_title(&self, title: &str) -> Result<&SheetModel> {
        self.sheets
            .iter()
            .find(|s| s.title == title)
            .or_else(|| self.sheets.iter().find(|s| s.title.eq_ignore_ascii_case(title)))
            .ok_or_else(|| CoreError::not_found(format!("No sheet named '{}'", title)))
    }

    pub fn index_of(&self, sheet_id: SheetId) -> Option<u32> {
        self.sheets.iter().position(|s| s.sheet_id == sheet_id).map(|i| i as u32)
    }

    /// Resolve a sheet reference; `None` is the first sheet.
    pub fn resolve(&self, sheet: Option<&SheetRef>) -> Result<&SheetModel> {
        match sheet {
            Some(SheetRef::Id(id)) => self.sheet(*id),
            Some(SheetRef::Title(title)) => self.sheet_by_title(title),
            None => self
                .sheets
                .first()
                .ok_or_else(|| CoreError::not_found("Spreadsheet has no sheets")),
        }
    }

    /// Resolve an A1 range to a structural range (open bounds stay open).
    pub fn grid_range(&self, range: &A1Range) -> Result<GridRange> {
        let sheet = match &range.sheet {
            Some(title) => self.sheet_by_title(title)?,
            None => self.resolve(None)?,
        };
        Ok(GridRange {
            sheet_id: sheet.sheet_id,
            start_row_index: range.start_row,
            end_row_index: range.end_row,
            start_column_index: range.start_col,
            end_column_index: range.end_col,
        })
    }

    pub fn next_banding_id(&self) -> i64 {
        self.sheets
            .iter()
            .flat_map(|s| s.banded_ranges.iter())
            .filter_map(|b| b.banded_range_id)
            .max()
            .map_or(1, |id| id + 1)
    }

    /// Render as a spreadsheet read. `grid` selects which rectangles carry
    /// cell data: `None` for metadata only, an empty slice for everything.
    pub fn to_spreadsheet(&self, spreadsheet_id: &str, grid: Option<&[GridRange]>) -> Spreadsheet {
        let sheets = self
            .sheets
            .iter()
            .enumerate()
            .filter(|(_, s)| match grid {
                Some(ranges) if !ranges.is_empty() => {
                    ranges.iter().any(|r| r.sheet_id == s.sheet_id)
                }
                _ => true,
            })
            .map(|(index, s)| {
                let data = match grid {
                    None => Vec::new(),
                    Some([]) => vec![grid_data(s, 0, s.row_count, 0, s.column_count)],
                    Some(ranges) => ranges
                        .iter()
                        .filter(|r| r.sheet_id == s.sheet_id)
                        .map(|r| {
                            let (sr, er, sc, ec) = r.clamp_to(s.row_count, s.column_count);
                            grid_data(s, sr, er, sc, ec)
                        })
                        .collect(),
                };
                Sheet {
                    properties: s.properties(index as u32),
                    data,
                    conditional_formats: s.conditional_formats.clone(),
                    banded_ranges: s.banded_ranges.clone(),
                }
            })
            .collect();
        Spreadsheet {
            spreadsheet_id: spreadsheet_id.to_string(),
            properties: SpreadsheetProperties { title: self.title.clone() },
            sheets,
            named_ranges: self.named_ranges.clone(),
        }
    }

    /// Apply requests atomically: on error nothing changes.
    pub fn apply_all(&mut self, requests: &[Request]) -> Result<Vec<Value>> {
        let mut next = self.clone();
        let mut replies = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            let reply = next.apply(request).map_err(|mut e| {
                e.message = format!("requests[{}] ({}): {}", i, request.kind(), e.message);
                e
            })?;
            replies.push(reply);
        }
        *self = next;
        Ok(replies)
    }

    /// Apply one request and return its reply object.
    pub fn apply(&mut self, request: &Request) -> Result<Value> {
        match request {
            Request::UpdateCells(req) => {
                let mask = FieldMask::parse(&req.fields)?;
                let sheet = self.sheet_mut(req.range.sheet_id)?;
                let start_row = req.range.start_row_index.unwrap_or(0);
                let start_col = req.range.start_column_index.unwrap_or(0);
                let row_limit =
                    req.range.end_row_index.unwrap_or(sheet.row_count).min(sheet.row_count);
                let col_limit = req
                    .range
                    .end_column_index
                    .unwrap_or(sheet.column_count)
                    .min(sheet.column_count);
                for (i, row) in req.rows.iter().enumerate() {
                    let r = start_row + i as u32;
                    let c = start_col + row.values.len() as u32;
                    if !row.values.is_empty() && (r >= row_limit || c > col_limit) {
                        return Err(CoreError::validation(format!(
                            "Range ({}) exceeds grid limits. Max rows: {}, max columns: {}",
                            sheet.title, sheet.row_count, sheet.column_count
                        )));
                    }
                }
                let (sr, er, sc, ec) = req.range.clamp_to(sheet.row_count, sheet.column_count);
                let blank = CellData::default();
                for (r, c) in sheet.keys_in(sr, er, sc, ec) {
                    sheet.merge(r, c, &blank, &mask);
                }
                for (i, row) in req.rows.iter().enumerate() {
                    for (j, cell) in row.values.iter().enumerate() {
                        sheet.merge(start_row + i as u32, start_col + j as u32, cell, &mask);
                    }
                }
                Ok(json!({}))
            }
            Request::AppendCells(req) => {
                let mask = FieldMask::parse(&req.fields)?;
                let sheet = self.sheet_mut(req.sheet_id)?;
                let width = req.rows.iter().map(|r| r.values.len()).max().unwrap_or(0) as u32;
                if width > sheet.column_count {
                    return Err(CoreError::validation(format!(
                        "Appended rows are {} columns wide; '{}' has {}",
                        width, sheet.title, sheet.column_count
                    )));
                }
                let at = sheet.data_extent();
                let end = at + req.rows.len() as u32;
                if end > sheet.row_count {
                    sheet.row_count = end;
                }
                for (i, row) in req.rows.iter().enumerate() {
                    for (j, cell) in row.values.iter().enumerate() {
                        sheet.merge(at + i as u32, j as u32, cell, &mask);
                    }
                }
                Ok(json!({}))
            }
            Request::RepeatCell(req) => {
                let mask = FieldMask::parse(&req.fields)?;
                let sheet = self.sheet_mut(req.range.sheet_id)?;
                let (sr, er, sc, ec) = req.range.clamp_to(sheet.row_count, sheet.column_count);
                for r in sr..er {
                    for c in sc..ec {
                        sheet.merge(r, c, &req.cell, &mask);
                    }
                }
                Ok(json!({}))
            }
            Request::InsertDimension(req) => {
                self.insert_dimension(&req.range, req.inherit_from_before)?;
                Ok(json!({}))
            }
            Request::DeleteDimension(req) => {
                self.delete_dimension(&req.range)?;
                Ok(json!({}))
            }
            Request::MoveDimension(req) => {
                self.move_dimension(&req.source, req.destination_index)?;
                Ok(json!({}))
            }
            Request::AddSheet(req) => {
                let props = self.add_sheet(&req.properties)?;
                Ok(json!({ "addSheet": { "properties": props } }))
            }
            Request::DeleteSheet(req) => {
                self.sheet(req.sheet_id)?;
                if self.sheets.len() == 1 {
                    return Err(CoreError::validation(
                        "You can't remove all the sheets in a document",
                    ));
                }
                self.sheets.retain(|s| s.sheet_id != req.sheet_id);
                self.named_ranges.retain(|n| n.range.sheet_id != req.sheet_id);
                Ok(json!({}))
            }
            Request::DuplicateSheet(req) => {
                let props = self.duplicate_sheet(req)?;
                Ok(json!({ "duplicateSheet": { "properties": props } }))
            }
            Request::FindReplace(req) => {
                let reply = self.find_replace(req)?;
                Ok(json!({ "findReplace": reply }))
            }
            Request::AddConditionalFormatRule(req) => {
                let Some(first) = req.rule.ranges.first() else {
                    return Err(CoreError::validation("Conditional format rule has no ranges"));
                };
                let sheet_id = first.sheet_id;
                if req.rule.ranges.iter().any(|r| r.sheet_id != sheet_id) {
                    return Err(CoreError::validation(
                        "Conditional format ranges must share one sheet",
                    ));
                }
                let sheet = self.sheet_mut(sheet_id)?;
                let at = (req.index as usize).min(sheet.conditional_formats.len());
                sheet.conditional_formats.insert(at, req.rule.clone());
                Ok(json!({}))
            }
            Request::DeleteConditionalFormatRule(req) => {
                let sheet = self.sheet_mut(req.sheet_id)?;
                if req.index as usize >= sheet.conditional_formats.len() {
                    return Err(CoreError::validation(format!(
                        "No conditional format rule at index {} on '{}'",
                        req.index, sheet.title
                    )));
                }
                let rule = sheet.conditional_formats.remove(req.index as usize);
                Ok(json!({ "deleteConditionalFormatRule": { "rule": rule } }))
            }
            Request::AddNamedRange(req) => {
                let mut named = req.named_range.clone();
                self.sheet(named.range.sheet_id)?;
                if self.named_ranges.iter().any(|n| n.name.eq_ignore_ascii_case(&named.name)) {
                    return Err(CoreError::validation(format!(
                        "A named range '{}' already exists",
                        named.name
                    )));
                }
                let id = named
                    .named_range_id
                    .clone()
                    .unwrap_or_else(|| format!("nr_{}", named.name));
                let taken = |n: &NamedRange| n.named_range_id.as_deref() == Some(id.as_str());
                if self.named_ranges.iter().any(taken) {
                    return Err(CoreError::validation(format!("Named range id '{}' is taken", id)));
                }
                named.named_range_id = Some(id);
                self.named_ranges.push(named.clone());
                Ok(json!({ "addNamedRange": { "namedRange": named } }))
            }
            Request::DeleteNamedRange(req) => {
                let before = self.named_ranges.len();
                let target = req.named_range_id.as_str();
                self.named_ranges.retain(|n| n.named_range_id.as_deref() != Some(target));
                if self.named_ranges.len() == before {
                    return Err(CoreError::not_found(format!(
                        "No named range with id {}",
                        req.named_range_id
                    )));
                }
                Ok(json!({}))
            }
            Request::UpdateSheetProperties(req) => {
                self.update_sheet_properties(&req.properties, &req.fields)?;
                Ok(json!({}))
            }
            Request::AddBanding(req) => {
                let mut banded = req.banded_range.clone();
                let id = banded.banded_range_id.unwrap_or_else(|| self.next_banding_id());
                let mut existing = self.sheets.iter().flat_map(|s| s.banded_ranges.iter());
                if existing.any(|b| b.banded_range_id == Some(id)) {
                    return Err(CoreError::validation(format!("Banded range id {} is taken", id)));
                }
                let sheet = self.sheet_mut(banded.range.sheet_id)?;
                let (rows, cols) = (sheet.row_count, sheet.column_count);
                if sheet
                    .banded_ranges
                    .iter()
                    .any(|b| overlaps(&b.range, &banded.range, rows, cols))
                {
                    return Err(CoreError::validation(
                        "You cannot add alternating background colors to a range that already \
                         has alternating background colors",
                    ));
                }
                banded.banded_range_id = Some(id);
                sheet.banded_ranges.push(banded.clone());
                Ok(json!({ "addBanding": { "bandedRange": banded } }))
            }
            Request::DeleteBanding(req) => {
                let sheet = self
                    .sheets
                    .iter_mut()
                    .find(|s| {
                        s.banded_ranges
                            .iter()
                            .any(|b| b.banded_range_id == Some(req.banded_range_id))
                    })
                    .ok_or_else(|| {
                        CoreError::not_found(format!(
                            "No banded range with id {}",
                            req.banded_range_id
                        ))
                    })?;
                sheet.banded_ranges.retain(|b| b.banded_range_id != Some(req.banded_range_id));
                Ok(json!({}))
            }
            Request::AutoResizeDimensions(req) => {
                // Pixel sizes are not modeled.
                self.sheet(req.dimensions.sheet_id)?;
                Ok(json!({}))
            }
        }
    }

    // ── Structural requests ─────────────────────────────────────

    fn insert_dimension(
        &mut self,
        range: &DimensionRange,
        inherit_from_before: bool,
    ) -> Result<()> {
        let sheet = self.sheet_mut(range.sheet_id)?;
        let (s, n) = (range.start_index, range.len());
        if n == 0 || s > sheet.axis_len(range.dimension) {
            return Err(CoreError::validation(format!(
                "Cannot insert {} at {} on '{}'",
                n, s, sheet.title
            )));
        }
        if inherit_from_before && s == 0 {
            return Err(CoreError::validation(
                "Cannot inherit properties from before the first index",
            ));
        }
        let len = sheet.axis_len(range.dimension);
        let Some(new_len) = len.checked_add(n) else {
            return Err(CoreError::validation(format!(
                "Cannot grow '{}' past {} rows or columns",
                sheet.title,
                u32::MAX
            )));
        };
        sheet.remap(range.dimension, |i| Some(if i >= s { i + n } else { i }));
        sheet.set_axis_len(range.dimension, new_len);
        let dim = range.dimension;
        self.adjust_ranges(range.sheet_id, |r| shift_for_insert(r, dim, s, n));
        Ok(())
    }

    fn delete_dimension(&mut self, range: &DimensionRange) -> Result<()> {
        let sheet = self.sheet_mut(range.sheet_id)?;
        let (s, e) = (range.start_index, range.end_index);
        let len = sheet.axis_len(range.dimension);
        if s >= e || e > len {
            return Err(CoreError::validation(format!(
                "Cannot delete {}..{} on '{}' ({} available)",
                s, e, sheet.title, len
            )));
        }
        if e - s == len {
            return Err(CoreError::validation(
                "You can't delete all the rows or columns on the sheet",
            ));
        }
        let n = e - s;
        sheet.remap(range.dimension, |i| match i {
            i if i < s => Some(i),
            i if i < e => None,
            i => Some(i - n),
        });
        sheet.set_axis_len(range.dimension, len - n);
        if range.dimension == Dimension::Rows && sheet.frozen_rows > len - n {
            sheet.frozen_rows = len - n;
        }
        let dim = range.dimension;
        self.adjust_ranges(range.sheet_id, |r| shift_for_delete(r, dim, s, e));
        Ok(())
    }

    fn move_dimension(&mut self, source: &DimensionRange, destination: u32) -> Result<()> {
        let sheet = self.sheet_mut(source.sheet_id)?;
        let (s, e, d) = (source.start_index, source.end_index, destination);
        let len = sheet.axis_len(source.dimension);
        if s >= e || e > len || d > len || (s..=e).contains(&d) {
            return Err(CoreError::validation(format!(
                "Cannot move {}..{} to {} on '{}'",
                s, e, d, sheet.title
            )));
        }
        let n = e - s;
        sheet.remap(source.dimension, |i| Some(moved_index(i, s, e, d, n)));
        Ok(())
    }

    fn add_sheet(&mut self, props: &SheetProperties) -> Result<SheetProperties> {
        let id = match props.sheet_id {
            Some(id) => id,
            None => self.sheets.iter().map(|s| s.sheet_id).max().map_or(0, |m| m + 1),
        };
        if self.sheets.iter().any(|s| s.sheet_id == id) {
            return Err(CoreError::validation(format!("A sheet with id {} already exists", id)));
        }
        let title = props
            .title
            .clone()
            .unwrap_or_else(|| format!("Sheet{}", self.sheets.len() + 1));
        if self.sheets.iter().any(|s| s.title.eq_ignore_ascii_case(&title)) {
            return Err(CoreError::validation(format!(
                "A sheet with the name \"{}\" already exists. Please enter another name.",
                title
            )));
        }
        let grid = props.grid_properties.clone().unwrap_or_default();
        let mut sheet = SheetModel::new(
            id,
            &title,
            grid.row_count.unwrap_or(DEFAULT_ROWS),
            grid.column_count.unwrap_or(DEFAULT_COLUMNS),
        );
        sheet.frozen_rows = grid.frozen_row_count.unwrap_or(0);
        let at = props.index.map_or(self.sheets.len(), |i| (i as usize).min(self.sheets.len()));
        self.sheets.insert(at, sheet);
        Ok(self.sheets[at].properties(at as u32))
    }

    fn duplicate_sheet(
        &mut self,
        req: &gridrelay_protocol::DuplicateSheetRequest,
    ) -> Result<SheetProperties> {
        let source = self.sheet(req.source_sheet_id)?.clone();
        let source_index = self.index_of(req.source_sheet_id).unwrap_or(0);
        let id = match req.new_sheet_id {
            Some(id) => id,
            None => self.sheets.iter().map(|s| s.sheet_id).max().map_or(0, |m| m + 1),
        };
        if self.sheets.iter().any(|s| s.sheet_id == id) {
            return Err(CoreError::validation(format!("A sheet with id {} already exists", id)));
        }
        let title = req
            .new_sheet_name
            .clone()
            .unwrap_or_else(|| format!("Copy of {}", source.title));
        if self.sheets.iter().any(|s| s.title.eq_ignore_ascii_case(&title)) {
            return Err(CoreError::validation(format!(
                "A sheet with the name \"{}\" already exists. Please enter another name.",
                title
            )));
        }
        let mut copy = source;
        copy.sheet_id = id;
        copy.title = title;
        for rule in &mut copy.conditional_formats {
            for range in &mut rule.ranges {
                range.sheet_id = id;
            }
        }
        let mut next_band = self.next_banding_id();
        for band in &mut copy.banded_ranges {
            band.range.sheet_id = id;
            band.banded_range_id = Some(next_band);
            next_band += 1;
        }
        let at = req
            .insert_sheet_index
            .map_or(source_index as usize + 1, |i| i as usize)
            .min(self.sheets.len());
        self.sheets.insert(at, copy);
        Ok(self.sheets[at].properties(at as u32))
    }

    fn find_replace(&mut self, req: &gridrelay_protocol::FindReplaceRequest) -> Result<Value> {
        let pattern = if req.search_by_regex { req.find.clone() } else { regex::escape(&req.find) };
        let pattern = if req.match_entire_cell { format!("^(?:{})$", pattern) } else { pattern };
        let matcher = regex::RegexBuilder::new(&pattern)
            .case_insensitive(!req.match_case)
            .build()
            .map_err(|e| CoreError::validation(format!("Invalid search pattern: {}", e)))?;

        let targets: Vec<(SheetId, Option<GridRange>)> =
            match (&req.range, req.sheet_id, req.all_sheets) {
                (Some(range), _, _) => vec![(range.sheet_id, Some(range.clone()))],
                (None, Some(id), _) => vec![(id, None)],
                (None, None, Some(true)) => {
                    self.sheets.iter().map(|s| (s.sheet_id, None)).collect()
                }
                _ => {
                    return Err(CoreError::validation(
                        "findReplace needs a range, a sheet, or allSheets",
                    ))
                }
            };

        let (mut values, mut formulas, mut occurrences) = (0u64, 0u64, 0u64);
        let mut rows: BTreeSet<(SheetId, u32)> = BTreeSet::new();
        let mut sheets: BTreeSet<SheetId> = BTreeSet::new();
        for (sheet_id, range) in targets {
            let sheet = self.sheet_mut(sheet_id)?;
            let (sr, er, sc, ec) = match &range {
                Some(r) => r.clamp_to(sheet.row_count, sheet.column_count),
                None => (0, sheet.row_count, 0, sheet.column_count),
            };
            for key in sheet.keys_in(sr, er, sc, ec) {
                let Some(cell) = sheet.cells.get_mut(&key) else { continue };
                let (text, is_formula) = match &mut cell.user_entered_value {
                    Some(gridrelay_protocol::ExtendedValue::StringValue(s)) => (s, false),
                    Some(gridrelay_protocol::ExtendedValue::FormulaValue(f))
                        if req.include_formulas =>
                    {
                        (f, true)
                    }
                    _ => continue,
                };
                let hits = matcher.find_iter(text.as_str()).count() as u64;
                if hits == 0 {
                    continue;
                }
                let replaced = if req.search_by_regex {
                    matcher.replace_all(text.as_str(), req.replacement.as_str()).into_owned()
                } else {
                    matcher
                        .replace_all(text.as_str(), regex::NoExpand(&req.replacement))
                        .into_owned()
                };
                *text = replaced;
                occurrences += hits;
                if is_formula {
                    formulas += 1;
                } else {
                    values += 1;
                }
                rows.insert((sheet_id, key.0));
                sheets.insert(sheet_id);
            }
        }
        Ok(json!({
            "valuesChanged": values,
            "formulasChanged": formulas,
            "rowsChanged": rows.len(),
            "sheetsChanged": sheets.len(),
            "occurrencesChanged": occurrences,
        }))
    }

    fn update_sheet_properties(&mut self, props: &SheetProperties, fields: &str) -> Result<()> {
        let id = props
            .sheet_id
            .ok_or_else(|| {
                CoreError::validation("updateSheetProperties needs properties.sheetId")
            })?;
        let current_index = self
            .index_of(id)
            .ok_or_else(|| CoreError::not_found(format!("No sheet with id {}", id)))?;
        let grid = props.grid_properties.clone().unwrap_or_default();
        for field in fields.split(',').map(str::trim) {
            match field {
                "title" => {
                    let title = props.title.clone().unwrap_or_default();
                    let clash = |s: &SheetModel| {
                        s.sheet_id != id && s.title.eq_ignore_ascii_case(&title)
                    };
                    if self.sheets.iter().any(clash) {
                        return Err(CoreError::validation(format!(
                            "A sheet named '{}' already exists",
                            title
                        )));
                    }
                    self.sheet_mut(id)?.title = title;
                }
                "index" => {
                    let sheet = self.sheets.remove(current_index as usize);
                    let at = (props.index.unwrap_or(0) as usize).min(self.sheets.len());
                    self.sheets.insert(at, sheet);
                }
                "gridProperties.frozenRowCount" => {
                    let sheet = self.sheet_mut(id)?;
                    let frozen = grid.frozen_row_count.unwrap_or(0);
                    if frozen > sheet.row_count {
                        return Err(CoreError::validation(format!(
                            "Cannot freeze {} rows on '{}' ({} rows)",
                            frozen, sheet.title, sheet.row_count
                        )));
                    }
                    sheet.frozen_rows = frozen;
                }
                "gridProperties.rowCount" => {
                    let sheet = self.sheet_mut(id)?;
                    sheet.row_count = grid.row_count.unwrap_or(sheet.row_count);
                    let rows = sheet.row_count;
                    sheet.cells.retain(|(r, _), _| *r < rows);
                }
                "gridProperties.columnCount" => {
                    let sheet = self.sheet_mut(id)?;
                    sheet.column_count = grid.column_count.unwrap_or(sheet.column_count);
                    let cols = sheet.column_count;
                    sheet.cells.retain(|(_, c), _| *c < cols);
                }
                other => {
                    return Err(CoreError::validation(format!(
                        "Unsupported sheet property field '{}'",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    fn adjust_ranges(&mut self, sheet_id: SheetId, f: impl Fn(&mut GridRange) -> bool) {
        self.named_ranges.retain_mut(|n| n.range.sheet_id != sheet_id || f(&mut n.range));
        if let Ok(sheet) = self.sheet_mut(sheet_id) {
            for rule in &mut sheet.conditional_formats {
                rule.ranges.retain_mut(|r| f(r));
            }
            sheet.conditional_formats.retain(|rule| !rule.ranges.is_empty());
            sheet.banded_ranges.retain_mut(|b| f(&mut b.range));
        }
    }
}

/// Where index `i` lands after moving `[s, e)` to `d` (pre-removal coordinates).
pub fn moved_index(i: u32, s: u32, e: u32, d: u32, n: u32) -> u32 {
    if d > e {
        match i {
            i if i >= s && i < e => d - n + (i - s),
            i if i >= e && i < d => i - n,
            i => i,
        }
    } else {
        match i {
            i if i >= s && i < e => d + (i - s),
            i if i >= d && i < s => i + n,
            i => i,
        }
    }
}

/// Render one cell the way the values endpoint does. Formulas are not
/// evaluated; their text stands in for the result.
pub fn render_value(cell: &CellData, render: ValueRenderOption) -> Option<Value> {
    use gridrelay_protocol::ExtendedValue as V;
    let value = cell.user_entered_value.as_ref()?;
    Some(match (value, render) {
        (V::NumberValue(n), ValueRenderOption::FormattedValue) => json!(format_number(*n)),
        (V::NumberValue(n), _) => json!(n),
        (V::BoolValue(b), ValueRenderOption::FormattedValue) => {
            json!(if *b { "TRUE" } else { "FALSE" })
        }
        (V::BoolValue(b), _) => json!(b),
        (V::StringValue(s), _) | (V::FormulaValue(s), _) => json!(s),
    })
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn grid_data(sheet: &SheetModel, sr: u32, er: u32, sc: u32, ec: u32) -> GridData {
    let mut rows = sheet.snapshot(sr, er, sc, ec);
    for row in &mut rows {
        while row.values.last().map_or(false, CellData::is_empty) {
            row.values.pop();
        }
    }
    while rows.last().map_or(false, |r| r.values.is_empty()) {
        rows.pop();
    }
    GridData { start_row: sr, start_column: sc, row_data: rows }
}

fn tidy(cell: &mut CellData) {
    cell.formatted_value = None;
    if let Some(format) = cell.user_entered_format.as_mut() {
        if format.text_format.as_ref().map_or(false, |t| *t == TextFormat::default()) {
            format.text_format = None;
        }
    }
    if cell.user_entered_format.as_ref().map_or(false, CellFormat::is_empty) {
        cell.user_entered_format = None;
    }
}

fn overlaps(a: &GridRange, b: &GridRange, rows: u32, cols: u32) -> bool {
    let (ar0, ar1, ac0, ac1) = a.clamp_to(rows, cols);
    let (br0, br1, bc0, bc1) = b.clamp_to(rows, cols);
    ar0 < br1 && br0 < ar1 && ac0 < bc1 && bc0 < ac1
}

fn axis_bounds(range: &mut GridRange, dim: Dimension) -> (&mut Option<u32>, &mut Option<u32>) {
    match dim {
        Dimension::Rows => (&mut range.start_row_index, &mut range.end_row_index),
        Dimension::Columns => (&mut range.start_column_index, &mut range.end_column_index),
    }
}

fn shift_for_insert(range: &mut GridRange, dim: Dimension, at: u32, n: u32) -> bool {
    let (start, end) = axis_bounds(range, dim);
    if let Some(s) = start.as_mut() {
        if *s >= at {
            *s += n;
        }
    }
    if let Some(e) = end.as_mut() {
        if *e > at {
            *e += n;
        }
    }
    true
}

fn shift_for_delete(range: &mut GridRange, dim: Dimension, s: u32, e: u32) -> bool {
    let n = e - s;
    let (start, end) = axis_bounds(range, dim);
    let squeeze = |i: u32| match i {
        i if i <= s => i,
        i if i <= e => s,
        i => i - n,
    };
    if let Some(v) = start.as_mut() {
        *v = squeeze(*v);
    }
    if let Some(v) = end.as_mut() {
        *v = squeeze(*v);
    }
    match (*start, *end) {
        (Some(a), Some(b)) => a < b,
        _ => true,
    }
}

// =============================================================================
// Field masks
// =============================================================================

/// Parsed `fields` mask of updateCells / repeatCell / appendCells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMask {
    paths: Vec<MaskPath>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MaskPath {
    Value,
    Format,
    Background,
    TextFormat,
    ForegroundColor,
    Bold,
    Italic,
    HorizontalAlignment,
    NumberFormat,
}

impl FieldMask {
    pub fn parse(fields: &str) -> Result<Self> {
        let mut paths = Vec::new();
        for field in fields.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let path = match field {
                "*" => {
                    paths.push(MaskPath::Value);
                    MaskPath::Format
                }
                "userEnteredValue" => MaskPath::Value,
                "userEnteredFormat" => MaskPath::Format,
                "userEnteredFormat.backgroundColor" => MaskPath::Background,
                "userEnteredFormat.textFormat" => MaskPath::TextFormat,
                "userEnteredFormat.textFormat.foregroundColor" => MaskPath::ForegroundColor,
                "userEnteredFormat.textFormat.bold" => MaskPath::Bold,
                "userEnteredFormat.textFormat.italic" => MaskPath::Italic,
                "userEnteredFormat.horizontalAlignment" => MaskPath::HorizontalAlignment,
                "userEnteredFormat.numberFormat" => MaskPath::NumberFormat,
                other => {
                    return Err(CoreError::validation(format!(
                        "Unsupported field mask '{}'",
                        other
                    )))
                }
            };
            paths.push(path);
        }
        if paths.is_empty() {
            return Err(CoreError::validation("Field mask is empty"));
        }
        Ok(Self { paths })
    }

    fn apply(&self, target: &mut CellData, source: &CellData) {
        for path in &self.paths {
            let src_format = source.user_entered_format.as_ref();
            let src_text = src_format.and_then(|f| f.text_format.as_ref());
            match path {
                MaskPath::Value => target.user_entered_value = source.user_entered_value.clone(),
                MaskPath::Format => target.user_entered_format = source.user_entered_format.clone(),
                MaskPath::Background => {
                    format_of(target).background_color =
                        src_format.and_then(|f| f.background_color);
                }
                MaskPath::TextFormat => {
                    format_of(target).text_format = src_text.cloned();
                }
                MaskPath::ForegroundColor => {
                    text_of(target).foreground_color = src_text.and_then(|t| t.foreground_color);
                }
                MaskPath::Bold => text_of(target).bold = src_text.and_then(|t| t.bold),
                MaskPath::Italic => text_of(target).italic = src_text.and_then(|t| t.italic),
                MaskPath::HorizontalAlignment => {
                    format_of(target).horizontal_alignment =
                        src_format.and_then(|f| f.horizontal_alignment.clone());
                }
                MaskPath::NumberFormat => {
                    format_of(target).number_format =
                        src_format.and_then(|f| f.number_format.clone());
                }
            }
        }
    }
}

fn format_of(cell: &mut CellData) -> &mut CellFormat {
    cell.user_entered_format.get_or_insert_with(CellFormat::default)
}

fn text_of(cell: &mut CellData) -> &mut TextFormat {
    format_of(cell).text_format.get_or_insert_with(TextFormat::default)
}
