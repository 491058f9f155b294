//! Action catalogue.
//!
//! Every supported action is a variant of [`Action`]; labels resolve through
//! the static [`ACTIONS`] table, never by reflection.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ReadRange,
    GetMetadata,
    WriteRange,
    AppendRows,
    ClearRange,
    FormatRange,
    FindReplace,
    InsertDimension,
    DeleteDimension,
    MoveDimension,
    AddSheet,
    DeleteSheet,
    DuplicateSheet,
    AddNamedRange,
    AddConditionalRule,
    ApplyPreset,
}

/// One row of the dispatch table.
#[derive(Debug)]
pub struct ActionSpec {
    pub action: Action,
    pub label: &'static str,
    pub kind: OperationKind,
}

const fn spec(action: Action, label: &'static str, kind: OperationKind) -> ActionSpec {
    ActionSpec { action, label, kind }
}

pub static ACTIONS: &[ActionSpec] = &[
    spec(Action::ReadRange, "read_range", OperationKind::Read),
    spec(Action::GetMetadata, "get_metadata", OperationKind::Read),
    spec(Action::WriteRange, "write_range", OperationKind::Write),
    spec(Action::AppendRows, "append_rows", OperationKind::Write),
    spec(Action::ClearRange, "clear_range", OperationKind::Write),
    spec(Action::FormatRange, "format_range", OperationKind::Write),
    spec(Action::FindReplace, "find_replace", OperationKind::Write),
    spec(Action::InsertDimension, "insert_dimension", OperationKind::Structural),
    spec(Action::DeleteDimension, "delete_dimension", OperationKind::Structural),
    spec(Action::MoveDimension, "move_dimension", OperationKind::Structural),
    spec(Action::AddSheet, "add_sheet", OperationKind::Structural),
    spec(Action::DeleteSheet, "delete_sheet", OperationKind::Structural),
    spec(Action::DuplicateSheet, "duplicate_sheet", OperationKind::Structural),
    spec(Action::AddNamedRange, "add_named_range", OperationKind::Structural),
    spec(Action::AddConditionalRule, "add_conditional_rule", OperationKind::Structural),
    spec(Action::ApplyPreset, "apply_preset", OperationKind::Structural),
];

impl Action {
    /// Resolve a caller-supplied label (case-insensitive).
    pub fn from_label(label: &str) -> Result<Action> {
        let wanted = label.trim();
        ACTIONS
            .iter()
            .find(|spec| spec.label.eq_ignore_ascii_case(wanted))
            .map(|spec| spec.action)
            .ok_or_else(|| CoreError::unsupported_action(wanted))
    }

    pub fn spec(&self) -> &'static ActionSpec {
        // Every variant has a table row (see test_table_covers_every_action).
        ACTIONS.iter().find(|spec| spec.action == *self).unwrap_or(&ACTIONS[0])
    }

    pub fn label(&self) -> &'static str {
        self.spec().label
    }

    pub fn kind(&self) -> OperationKind {
        self.spec().kind
    }

    pub fn is_mutating(&self) -> bool {
        self.kind() != OperationKind::Read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_table_covers_every_action() {
        let all = [
            Action::ReadRange,
            Action::GetMetadata,
            Action::WriteRange,
            Action::AppendRows,
            Action::ClearRange,
            Action::FormatRange,
            Action::FindReplace,
            Action::InsertDimension,
            Action::DeleteDimension,
            Action::MoveDimension,
            Action::AddSheet,
            Action::DeleteSheet,
            Action::DuplicateSheet,
            Action::AddNamedRange,
            Action::AddConditionalRule,
            Action::ApplyPreset,
        ];
        assert_eq!(all.len(), ACTIONS.len());
        for action in all {
            assert_eq!(action.spec().action, action);
            assert_eq!(Action::from_label(action.label()).unwrap(), action);
        }
    }

    #[test]
    fn test_label_case_insensitive() {
        assert_eq!(Action::from_label("WRITE_RANGE").unwrap(), Action::WriteRange);
        assert_eq!(Action::from_label(" Write_Range ").unwrap(), Action::WriteRange);
    }

    #[test]
    fn test_unknown_label() {
        let err = Action::from_label("render_chart").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedAction);
    }

    #[test]
    fn test_kinds() {
        assert!(!Action::ReadRange.is_mutating());
        assert_eq!(Action::WriteRange.kind(), OperationKind::Write);
        assert_eq!(Action::DeleteSheet.kind(), OperationKind::Structural);
    }
}
