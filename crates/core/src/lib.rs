//! gridrelay core types.
//!
//! Operations as callers submit them, the action catalogue, A1 range
//! parsing, and the normalizer that turns loose parameters into typed,
//! canonical [`Params`]. Also the error taxonomy shared by every layer.
//!
//! Nothing in this crate performs I/O.

pub mod action;
pub mod error;
pub mod normalize;
pub mod operation;
pub mod params;
pub mod range;

pub use action::{Action, ActionSpec, OperationKind, ACTIONS};
pub use error::{ConflictDetail, CoreError, ErrorCode, Result};
pub use normalize::{
    normalize_color, normalize_token, token_name, ColorInput, ConditionType, ConflictResolution,
    HorizontalAlignment, NumberFormatType, Preset, Token, ValueInputOption,
};
pub use operation::{
    EntryId, Operation, OperationId, OperationResult, Payload, SheetSummary, SpreadsheetId,
    TransactionId,
};
pub use params::{
    normalize, CellInput, FindScope, FormatSpec, NormalizedOp, Params, Scope, SheetRef,
};
pub use range::{col_to_letters, letters_to_col, parse_a1, A1Range};
