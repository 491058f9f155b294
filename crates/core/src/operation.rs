//! Operations and their results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::{Action, OperationKind};
use crate::error::{CoreError, ErrorCode, Result};

macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

generated_id!(
    /// Identifies one caller-requested operation.
    OperationId, "op"
);
generated_id!(
    /// Identifies one transaction.
    TransactionId, "txn"
);
generated_id!(
    /// Identifies one history entry.
    EntryId, "hist"
);

/// Remote spreadsheet identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpreadsheetId(String);

impl SpreadsheetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SpreadsheetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SpreadsheetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SpreadsheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical, caller-requested action against a spreadsheet.
///
/// Arrives schema-validated from the outer protocol layer. The action label
/// and parameters are resolved by the normalizer; nothing here is trusted
/// beyond its JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub id: OperationId,
    pub spreadsheet_id: SpreadsheetId,
    /// Action label, e.g. "write_range" (any case).
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    /// Revision the caller last observed for the target range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_revision: Option<String>,
    /// Conflict resolution token: keep_local, keep_remote, manual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl Operation {
    pub fn new(
        spreadsheet_id: impl Into<SpreadsheetId>,
        action: &str,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: OperationId::new(),
            spreadsheet_id: spreadsheet_id.into(),
            action: action.to_string(),
            params,
            transaction_id: None,
            baseline_revision: None,
            resolution: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_baseline(mut self, revision: impl Into<String>) -> Self {
        self.baseline_revision = Some(revision.into());
        self
    }

    pub fn with_resolution(mut self, resolution: &str) -> Self {
        self.resolution = Some(resolution.to_string());
        self
    }

    pub fn in_transaction(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn kind(&self) -> Result<OperationKind> {
        Ok(Action::from_label(&self.action)?.kind())
    }
}

/// Summary of one sheet in a metadata read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub sheet_id: i64,
    pub title: String,
    pub index: u32,
    pub row_count: u32,
    pub column_count: u32,
    pub frozen_row_count: u32,
}

/// Typed success payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Payload {
    /// Values read from a range, with the revision of what was read.
    Values {
        range: String,
        values: Vec<Vec<serde_json::Value>>,
        revision: String,
    },
    /// Spreadsheet structure; grid data only in full diff mode.
    Metadata {
        title: String,
        sheets: Vec<SheetSummary>,
        named_ranges: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grid: Option<serde_json::Value>,
    },
    /// Applied; the request carries no reply data.
    Applied,
    CellsUpdated {
        updated_cells: u64,
    },
    SheetAdded {
        sheet_id: i64,
        title: String,
        index: u32,
    },
    SheetDuplicated {
        sheet_id: i64,
        title: String,
        index: u32,
    },
    Replaced {
        occurrences_changed: u64,
        values_changed: u64,
        formulas_changed: u64,
        rows_changed: u64,
        sheets_changed: u64,
    },
    NamedRangeAdded {
        named_range_id: String,
        name: String,
    },
    BandingAdded {
        banded_range_id: i64,
    },
    /// One result per native request of a multi-request operation.
    Composite {
        parts: Vec<Payload>,
    },
    /// Queued into an open transaction; nothing dispatched yet.
    Queued {
        transaction_id: TransactionId,
        position: usize,
    },
    /// Dropped by `keep_remote` after a revision mismatch.
    Skipped {
        reason: String,
    },
}

/// Outcome of one operation. Exactly one per submitted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: OperationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
}

impl OperationResult {
    pub fn ok(operation_id: OperationId, payload: Payload) -> Self {
        Self { operation_id, success: true, payload: Some(payload), error: None }
    }

    pub fn err(operation_id: OperationId, error: CoreError) -> Self {
        Self { operation_id, success: false, payload: None, error: Some(error) }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Outcome label for counters: "ok" or the error code.
    pub fn outcome_label(&self) -> &'static str {
        match &self.error {
            Some(e) => e.code.as_str(),
            None => "OK",
        }
    }
}
