//! Error taxonomy.
//!
//! Every failure that leaves the engine carries a stable code, a human
//! message, and (for conflicts) the competing revisions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, wire-visible error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    UnsupportedAction,
    NotFound,
    PermissionDenied,
    RateLimitExceeded,
    PayloadTooLarge,
    Conflict,
    Timeout,
    TransactionNotFound,
    TransactionClosed,
    TransactionExpired,
    AuthExpired,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::UnsupportedAction => "UNSUPPORTED_ACTION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            ErrorCode::TransactionClosed => "TRANSACTION_CLOSED",
            ErrorCode::TransactionExpired => "TRANSACTION_EXPIRED",
            ErrorCode::AuthExpired => "AUTH_EXPIRED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two sides of an optimistic-concurrency mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    /// A1 range the revisions were computed over.
    pub range: String,
    /// Baseline revision supplied by the caller.
    pub expected: String,
    /// Live revision observed at commit time.
    pub actual: String,
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    /// Offending parameter path for validation failures (e.g. `params.dimension`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), field: None, conflict: None, retry_after_ms: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Validation failure pinned to a parameter path.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("{}: {}", field, message.into());
        Self { field: Some(field), ..Self::validation(message) }
    }

    pub fn unsupported_action(label: &str) -> Self {
        Self::new(ErrorCode::UnsupportedAction, format!("Unsupported action '{}'", label))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn payload_too_large(size: usize, limit: usize) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("Request is {} bytes; the batch ceiling is {} bytes", size, limit),
        )
    }

    pub fn rate_limited(retry_after_ms: Option<u64>) -> Self {
        Self {
            retry_after_ms,
            ..Self::new(ErrorCode::RateLimitExceeded, "Quota exhausted")
        }
    }

    pub fn conflict(
        range: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        let detail = ConflictDetail {
            range: range.into(),
            expected: expected.into(),
            actual: actual.into(),
        };
        Self {
            conflict: Some(detail.clone()),
            ..Self::new(
                ErrorCode::Conflict,
                format!(
                    "Range {} changed since baseline (expected {}, found {})",
                    detail.range, detail.expected, detail.actual
                ),
            )
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(ErrorCode::Timeout, format!("Remote call timed out after {}ms", after_ms))
    }

    pub fn cancelled(operation_id: &str) -> Self {
        Self::new(
            ErrorCode::Cancelled,
            format!("Operation {} was cancelled before dispatch", operation_id),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}
