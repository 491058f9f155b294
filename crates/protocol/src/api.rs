//! The remote API seam.
//!
//! Implementations are blocking; the engine runs them off the async executor.

use std::fmt;

use crate::{BatchUpdateRequest, BatchUpdateResponse, Spreadsheet, ValueRange, ValueRenderOption};

/// Query for `GET spreadsheets/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpreadsheetQuery {
    /// A1 ranges to include grid data for (empty = whole spreadsheet).
    pub ranges: Vec<String>,
    /// Include cell data, not just sheet properties.
    pub include_grid_data: bool,
}

impl SpreadsheetQuery {
    pub fn metadata() -> Self {
        Self::default()
    }

    pub fn grid(ranges: Vec<String>) -> Self {
        Self { ranges, include_grid_data: true }
    }
}

/// The remote spreadsheet API.
///
/// Three calls cover both calling conventions: independent reads (values and
/// metadata) and the atomic multi-request batch endpoint.
pub trait SheetsApi: Send + Sync {
    /// Read the values of one A1 range.
    fn get_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        render: ValueRenderOption,
    ) -> Result<ValueRange, RemoteError>;

    /// Read spreadsheet metadata, optionally with grid data for some ranges.
    fn get_spreadsheet(
        &self,
        spreadsheet_id: &str,
        query: &SpreadsheetQuery,
    ) -> Result<Spreadsheet, RemoteError>;

    /// Apply every request atomically. Either all apply or none do.
    fn batch_update(
        &self,
        spreadsheet_id: &str,
        body: &BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse, RemoteError>;
}

/// Classified failure of one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection reset, DNS failure, dropped socket
    Transport,
    /// 400: the remote rejected the request
    BadRequest,
    /// 401 or no usable credential
    Unauthorized,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 413
    PayloadTooLarge,
    /// 429
    RateLimited,
    /// 5xx
    Server,
    /// Success status but a body we could not decode
    Malformed,
}

/// Error returned by a [`SheetsApi`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    /// HTTP status, when there was a response.
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided Retry-After, in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into(), retry_after_ms: None }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transport, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Malformed, message)
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 | 422 => RemoteErrorKind::BadRequest,
            401 => RemoteErrorKind::Unauthorized,
            403 => RemoteErrorKind::Forbidden,
            404 => RemoteErrorKind::NotFound,
            413 => RemoteErrorKind::PayloadTooLarge,
            429 => RemoteErrorKind::RateLimited,
            s if s >= 500 => RemoteErrorKind::Server,
            _ => RemoteErrorKind::BadRequest,
        };
        Self { kind, status: Some(status), message: message.into(), retry_after_ms: None }
    }

    pub fn with_retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    /// Only transport failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Transport | RemoteErrorKind::Server | RemoteErrorKind::RateLimited
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RemoteError {}
