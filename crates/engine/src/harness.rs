//! In-memory remote spreadsheet for tests.
//!
//! `FakeSheets` implements [`SheetsApi`] on top of [`WorkbookModel`], the
//! same model the engine replays commits on. It:
//! - Applies batchUpdate atomically (all requests or none)
//! - Rejects bodies over the 9,000,000 byte ceiling with 413
//! - Counts calls per endpoint and records batch sizes
//! - Injects failures and latency on demand, including replies that arrive
//!   after the caller gave up
//!
//! Use it to test engine invariants without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gridrelay_core::{parse_a1, CoreError, ErrorCode};
use gridrelay_protocol::{
    BatchUpdateRequest, BatchUpdateResponse, CellData, ExtendedValue, GridRange, RemoteError,
    SheetsApi, Spreadsheet, SpreadsheetQuery, ValueRange, ValueRenderOption, BATCH_LIMIT_BYTES,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::model::{SheetModel, WorkbookModel, DEFAULT_COLUMNS, DEFAULT_ROWS};

#[derive(Debug, Clone, Copy)]
struct Stall {
    remaining: usize,
    delay: Duration,
    lands: bool,
}

#[derive(Default)]
pub struct FakeSheets {
    books: Mutex<HashMap<String, WorkbookModel>>,
    /// Fail the next calls, whatever the endpoint.
    failures: Mutex<VecDeque<RemoteError>>,
    /// Let this many batchUpdate calls through, then fail one.
    batch_failure: Mutex<Option<(usize, RemoteError)>>,
    /// Let this many batchUpdate calls through, then stall one.
    batch_stall: Mutex<Option<Stall>>,
    latency: Mutex<Duration>,
    values_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl FakeSheets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_book(spreadsheet_id: &str, book: WorkbookModel) -> Self {
        let fake = Self::new();
        fake.insert_book(spreadsheet_id, book);
        fake
    }

    /// One empty 1000x26 sheet, "Sheet1" with id 0.
    pub fn with_default_book(spreadsheet_id: &str) -> Self {
        let sheet = SheetModel::new(0, "Sheet1", DEFAULT_ROWS, DEFAULT_COLUMNS);
        let book = WorkbookModel::new("Untitled").with_sheet(sheet);
        Self::with_book(spreadsheet_id, book)
    }

    pub fn insert_book(&self, spreadsheet_id: &str, book: WorkbookModel) {
        self.books.lock().insert(spreadsheet_id.to_string(), book);
    }

    pub fn book(&self, spreadsheet_id: &str) -> Option<WorkbookModel> {
        self.books.lock().get(spreadsheet_id).cloned()
    }

    /// Edit a cell behind the engine's back, like another collaborator.
    pub fn set_cell(&self, spreadsheet_id: &str, sheet: &str, row: u32, col: u32, value: Value) {
        let mut books = self.books.lock();
        let Some(book) = books.get_mut(spreadsheet_id) else {
            return;
        };
        let Ok(sheet_id) = book.sheet_by_title(sheet).map(|s| s.sheet_id) else {
            return;
        };
        let user_entered_value = match value {
            Value::Null => None,
            Value::Bool(b) => Some(ExtendedValue::BoolValue(b)),
            Value::Number(n) => n.as_f64().map(ExtendedValue::NumberValue),
            Value::String(s) if s.starts_with('=') => Some(ExtendedValue::FormulaValue(s)),
            Value::String(s) => Some(ExtendedValue::StringValue(s)),
            other => Some(ExtendedValue::StringValue(other.to_string())),
        };
        if let Ok(target) = book.sheet_mut(sheet_id) {
            let mut cell = target.cell(row, col).cloned().unwrap_or_default();
            cell.user_entered_value = user_entered_value;
            target.put_cell(row, col, cell);
        }
    }

    pub fn cell(&self, spreadsheet_id: &str, sheet: &str, row: u32, col: u32) -> Option<CellData> {
        let books = self.books.lock();
        books.get(spreadsheet_id)?.sheet_by_title(sheet).ok()?.cell(row, col).cloned()
    }

    /// Everything about a spreadsheet, for exact before/after comparisons.
    pub fn state_json(&self, spreadsheet_id: &str) -> Value {
        let books = self.books.lock();
        match books.get(spreadsheet_id) {
            Some(book) => serde_json::to_value(book.to_spreadsheet(spreadsheet_id, Some(&[])))
                .unwrap_or(Value::Null),
            None => Value::Null,
        }
    }

    pub fn fail_next(&self, err: RemoteError) {
        self.failures.lock().push_back(err);
    }

    pub fn fail_batch_after(&self, successes: usize, err: RemoteError) {
        *self.batch_failure.lock() = Some((successes, err));
    }

    /// After `successes` batchUpdate calls, the next one answers only after
    /// `delay`. With `lands` its requests are applied before the wait,
    /// otherwise it fails with 503 and changes nothing.
    pub fn stall_batch_after(&self, successes: usize, delay: Duration, lands: bool) {
        *self.batch_stall.lock() = Some(Stall { remaining: successes, delay, lands });
    }

    /// Takes the pending stall once its turn comes.
    fn next_stall(&self) -> Option<Stall> {
        let mut pending = self.batch_stall.lock();
        match pending.as_mut() {
            Some(stall) if stall.remaining == 0 => pending.take(),
            Some(stall) => {
                stall.remaining -= 1;
                None
            }
            None => None,
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn values_calls(&self) -> usize {
        self.values_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Request counts of the batchUpdate calls that applied.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    fn before_call(&self, counter: &AtomicUsize) -> Result<(), RemoteError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn model_error(err: CoreError) -> RemoteError {
    let status = if err.code == ErrorCode::NotFound { 404 } else { 400 };
    RemoteError::from_status(status, err.message)
}

fn missing(spreadsheet_id: &str) -> RemoteError {
    RemoteError::from_status(404, format!("Requested entity was not found: {}", spreadsheet_id))
}

impl SheetsApi for FakeSheets {
    fn get_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        render: ValueRenderOption,
    ) -> Result<ValueRange, RemoteError> {
        self.before_call(&self.values_calls)?;
        let a1 = parse_a1("range", range).map_err(model_error)?;
        let books = self.books.lock();
        let book = books.get(spreadsheet_id).ok_or_else(|| missing(spreadsheet_id))?;
        let grid = book.grid_range(&a1).map_err(model_error)?;
        let sheet = book.sheet(grid.sheet_id).map_err(model_error)?;
        let (sr, er, sc, ec) = grid.clamp_to(sheet.row_count, sheet.column_count);
        Ok(ValueRange {
            range: a1.with_sheet(&sheet.title).to_a1(),
            major_dimension: Some("ROWS".into()),
            values: sheet.values(sr, er, sc, ec, render),
        })
    }

    fn get_spreadsheet(
        &self,
        spreadsheet_id: &str,
        query: &SpreadsheetQuery,
    ) -> Result<Spreadsheet, RemoteError> {
        self.before_call(&self.metadata_calls)?;
        let books = self.books.lock();
        let book = books.get(spreadsheet_id).ok_or_else(|| missing(spreadsheet_id))?;
        if !query.include_grid_data {
            return Ok(book.to_spreadsheet(spreadsheet_id, None));
        }
        let grids = query
            .ranges
            .iter()
            .map(|r| {
                let a1 = parse_a1("ranges", r).map_err(model_error)?;
                book.grid_range(&a1).map_err(model_error)
            })
            .collect::<Result<Vec<GridRange>, RemoteError>>()?;
        Ok(book.to_spreadsheet(spreadsheet_id, Some(&grids)))
    }

    fn batch_update(
        &self,
        spreadsheet_id: &str,
        body: &BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse, RemoteError> {
        self.before_call(&self.batch_calls)?;
        {
            let mut pending = self.batch_failure.lock();
            let fail_now = match pending.as_mut() {
                Some((0, _)) => true,
                Some((remaining, _)) => {
                    *remaining -= 1;
                    false
                }
                None => false,
            };
            if fail_now {
                if let Some((_, err)) = pending.take() {
                    return Err(err);
                }
            }
        }

        let size = serde_json::to_vec(body)
            .map_err(|e| RemoteError::malformed(e.to_string()))?
            .len();
        if size > BATCH_LIMIT_BYTES {
            return Err(RemoteError::from_status(413, format!("Request payload is {} bytes", size)));
        }
        let stall = self.next_stall();
        if let Some(Stall { delay, lands: false, .. }) = stall {
            std::thread::sleep(delay);
            return Err(RemoteError::from_status(503, "The service is currently unavailable."));
        }
        let replies = {
            let mut books = self.books.lock();
            let book = books.get_mut(spreadsheet_id).ok_or_else(|| missing(spreadsheet_id))?;
            book.apply_all(&body.requests).map_err(model_error)?
        };
        self.batch_sizes.lock().push(body.requests.len());
        if let Some(Stall { delay, .. }) = stall {
            std::thread::sleep(delay);
        }
        Ok(BatchUpdateResponse { spreadsheet_id: spreadsheet_id.to_string(), replies })
    }
}
