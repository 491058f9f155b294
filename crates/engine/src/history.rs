//! Undo/Redo history for committed mutating operations.
//!
//! One linear timeline per spreadsheet with a cursor: entries before the
//! cursor are applied (undoable), entries from the cursor on were undone
//! (redoable). Recording a new entry truncates the redo branch. The oldest
//! entries fall off once capacity is exceeded, which only limits undo
//! depth.
//!
//! The engine applies inverses remotely first and moves the cursor only
//! after the remote call succeeded (peek, dispatch, then mark).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use gridrelay_core::{
    CoreError, EntryId, NormalizedOp, OperationId, Result, SpreadsheetId, TransactionId,
};
use parking_lot::Mutex;
use serde::Serialize;

use crate::inverse::Inverse;

#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub id: EntryId,
    pub spreadsheet_id: SpreadsheetId,
    pub sequence: u64,
    pub transaction_id: Option<TransactionId>,
    pub forward: NormalizedOp,
    pub inverse: Inverse,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn operation_id(&self) -> &OperationId {
        &self.forward.id
    }
}

/// Every cursor move is itself a fact in the journal.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryFact {
    Commit { entry_id: EntryId, sequence: u64 },
    Undo { entry_id: EntryId },
    Redo { entry_id: EntryId },
    Revert { target: EntryId, undone: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub fact: HistoryFact,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub id: EntryId,
    pub sequence: u64,
    pub operation_id: OperationId,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    pub reversible: bool,
    /// Undone and waiting for redo.
    pub undone: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub spreadsheet_id: SpreadsheetId,
    pub cursor: usize,
    pub entries: Vec<EntrySummary>,
    pub journal: Vec<JournalRecord>,
}

#[derive(Default)]
struct Timeline {
    entries: VecDeque<HistoryEntry>,
    cursor: usize,
    next_seq: u64,
    journal: VecDeque<JournalRecord>,
}

impl Timeline {
    fn note(&mut self, fact: HistoryFact, capacity: usize) {
        self.journal.push_back(JournalRecord { at: Utc::now(), fact });
        // The journal outlives entries by a little, not forever
        while self.journal.len() > capacity * 4 {
            self.journal.pop_front();
        }
    }

    fn position(&self, id: &EntryId) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "No history entry {} (it may have been evicted)",
                    id
                ))
            })
    }
}

pub struct History {
    timelines: Mutex<HashMap<SpreadsheetId, Timeline>>,
    max_entries: usize,
}

impl History {
    pub fn new(max_entries: usize) -> Self {
        Self { timelines: Mutex::new(HashMap::new()), max_entries }
    }

    /// Record a committed operation. Clears the redo branch.
    pub fn record(
        &self,
        forward: NormalizedOp,
        inverse: Inverse,
        transaction_id: Option<TransactionId>,
    ) -> EntryId {
        let mut timelines = self.timelines.lock();
        let timeline = timelines.entry(forward.spreadsheet_id.clone()).or_default();

        let cursor = timeline.cursor;
        timeline.entries.truncate(cursor);
        let sequence = timeline.next_seq;
        timeline.next_seq += 1;
        let id = EntryId::new();
        timeline.entries.push_back(HistoryEntry {
            id: id.clone(),
            spreadsheet_id: forward.spreadsheet_id.clone(),
            sequence,
            transaction_id,
            forward,
            inverse,
            recorded_at: Utc::now(),
        });

        // Limit history size
        while timeline.entries.len() > self.max_entries {
            timeline.entries.pop_front();
        }
        timeline.cursor = timeline.entries.len();
        timeline.note(HistoryFact::Commit { entry_id: id.clone(), sequence }, self.max_entries);
        id
    }

    /// The entry undo would reverse.
    pub fn peek_undo(&self, spreadsheet_id: &SpreadsheetId) -> Result<HistoryEntry> {
        let timelines = self.timelines.lock();
        timelines
            .get(spreadsheet_id)
            .filter(|t| t.cursor > 0)
            .map(|t| t.entries[t.cursor - 1].clone())
            .ok_or_else(|| CoreError::validation(format!("Nothing to undo on {}", spreadsheet_id)))
    }

    pub fn mark_undone(&self, spreadsheet_id: &SpreadsheetId, entry_id: &EntryId) -> Result<()> {
        let mut timelines = self.timelines.lock();
        let timeline = timelines
            .get_mut(spreadsheet_id)
            .ok_or_else(|| CoreError::not_found(format!("No history for {}", spreadsheet_id)))?;
        if timeline.cursor == 0 || &timeline.entries[timeline.cursor - 1].id != entry_id {
            return Err(moved(spreadsheet_id, "undo"));
        }
        timeline.cursor -= 1;
        timeline.note(HistoryFact::Undo { entry_id: entry_id.clone() }, self.max_entries);
        Ok(())
    }

    /// The entry redo would re-apply.
    pub fn peek_redo(&self, spreadsheet_id: &SpreadsheetId) -> Result<HistoryEntry> {
        let timelines = self.timelines.lock();
        timelines
            .get(spreadsheet_id)
            .and_then(|t| t.entries.get(t.cursor).cloned())
            .ok_or_else(|| CoreError::validation(format!("Nothing to redo on {}", spreadsheet_id)))
    }

    /// Move past a redone entry, replacing its inverse with one captured
    /// against the state it was re-applied to.
    pub fn mark_redone(
        &self,
        spreadsheet_id: &SpreadsheetId,
        entry_id: &EntryId,
        inverse: Inverse,
    ) -> Result<()> {
        let mut timelines = self.timelines.lock();
        let timeline = timelines
            .get_mut(spreadsheet_id)
            .ok_or_else(|| CoreError::not_found(format!("No history for {}", spreadsheet_id)))?;
        let cursor = timeline.cursor;
        match timeline.entries.get_mut(cursor) {
            Some(entry) if &entry.id == entry_id => entry.inverse = inverse,
            _ => return Err(moved(spreadsheet_id, "redo")),
        }
        timeline.cursor += 1;
        timeline.note(HistoryFact::Redo { entry_id: entry_id.clone() }, self.max_entries);
        Ok(())
    }

    /// Applied entries after `target`, oldest first. Reverting to `target`
    /// means reversing these newest first.
    pub fn entries_after(
        &self,
        spreadsheet_id: &SpreadsheetId,
        target: &EntryId,
    ) -> Result<Vec<HistoryEntry>> {
        let timelines = self.timelines.lock();
        let timeline = timelines
            .get(spreadsheet_id)
            .ok_or_else(|| CoreError::not_found(format!("No history for {}", spreadsheet_id)))?;
        let pos = timeline.position(target)?;
        if pos >= timeline.cursor {
            return Err(CoreError::validation(format!(
                "Entry {} is undone; redo it instead",
                target
            )));
        }
        Ok(timeline.entries.range(pos + 1..timeline.cursor).cloned().collect())
    }

    /// Set the cursor just past `target` after its successors were reversed.
    pub fn mark_reverted(&self, spreadsheet_id: &SpreadsheetId, target: &EntryId) -> Result<()> {
        let mut timelines = self.timelines.lock();
        let timeline = timelines
            .get_mut(spreadsheet_id)
            .ok_or_else(|| CoreError::not_found(format!("No history for {}", spreadsheet_id)))?;
        let pos = timeline.position(target)?;
        let undone = timeline.cursor.saturating_sub(pos + 1);
        timeline.cursor = pos + 1;
        timeline.note(HistoryFact::Revert { target: target.clone(), undone }, self.max_entries);
        Ok(())
    }

    pub fn can_undo(&self, spreadsheet_id: &SpreadsheetId) -> bool {
        self.timelines.lock().get(spreadsheet_id).map_or(false, |t| t.cursor > 0)
    }

    pub fn can_redo(&self, spreadsheet_id: &SpreadsheetId) -> bool {
        self.timelines.lock().get(spreadsheet_id).map_or(false, |t| t.cursor < t.entries.len())
    }

    pub fn view(&self, spreadsheet_id: &SpreadsheetId) -> HistoryView {
        let timelines = self.timelines.lock();
        let Some(timeline) = timelines.get(spreadsheet_id) else {
            return HistoryView {
                spreadsheet_id: spreadsheet_id.clone(),
                cursor: 0,
                entries: Vec::new(),
                journal: Vec::new(),
            };
        };
        HistoryView {
            spreadsheet_id: spreadsheet_id.clone(),
            cursor: timeline.cursor,
            entries: timeline
                .entries
                .iter()
                .enumerate()
                .map(|(i, e)| EntrySummary {
                    id: e.id.clone(),
                    sequence: e.sequence,
                    operation_id: e.forward.id.clone(),
                    action: e.forward.action.label(),
                    transaction_id: e.transaction_id.clone(),
                    reversible: e.inverse.is_reversible(),
                    undone: i >= timeline.cursor,
                    recorded_at: e.recorded_at,
                })
                .collect(),
            journal: timeline.journal.iter().cloned().collect(),
        }
    }
}

fn moved(spreadsheet_id: &SpreadsheetId, during: &str) -> CoreError {
    CoreError::internal(format!("History of {} moved during {}", spreadsheet_id, during))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrelay_core::{normalize, ErrorCode, Operation};
    use serde_json::json;

    fn op(sheet: &str, n: i64) -> NormalizedOp {
        let params = json!({"range": "A1", "values": [[n]]});
        normalize(&Operation::new(sheet, "write_range", params)).unwrap()
    }

    fn sid(s: &str) -> SpreadsheetId {
        s.into()
    }

    #[test]
    fn test_undo_redo_cursor() {
        let h = History::new(100);
        let a = h.record(op("s", 1), Inverse::Nothing, None);
        let b = h.record(op("s", 2), Inverse::Nothing, None);
        assert_eq!(h.peek_undo(&sid("s")).unwrap().id, b);
        h.mark_undone(&sid("s"), &b).unwrap();
        assert_eq!(h.peek_undo(&sid("s")).unwrap().id, a);
        assert_eq!(h.peek_redo(&sid("s")).unwrap().id, b);
        h.mark_redone(&sid("s"), &b, Inverse::Nothing).unwrap();
        assert!(!h.can_redo(&sid("s")));
    }

    #[test]
    fn test_new_record_truncates_redo() {
        let h = History::new(100);
        h.record(op("s", 1), Inverse::Nothing, None);
        let b = h.record(op("s", 2), Inverse::Nothing, None);
        h.mark_undone(&sid("s"), &b).unwrap();
        assert!(h.can_redo(&sid("s")));
        h.record(op("s", 3), Inverse::Nothing, None);
        assert!(!h.can_redo(&sid("s")));
        assert_eq!(h.view(&sid("s")).entries.len(), 2);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let h = History::new(3);
        let first = h.record(op("s", 0), Inverse::Nothing, None);
        for n in 1..5 {
            h.record(op("s", n), Inverse::Nothing, None);
        }
        let view = h.view(&sid("s"));
        assert_eq!(view.entries.len(), 3);
        assert_eq!(view.cursor, 3);
        assert_eq!(view.entries[0].sequence, 2);
        let err = h.entries_after(&sid("s"), &first).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_timelines_are_per_spreadsheet() {
        let h = History::new(100);
        h.record(op("s1", 1), Inverse::Nothing, None);
        assert!(h.can_undo(&sid("s1")));
        assert!(!h.can_undo(&sid("s2")));
        assert_eq!(h.peek_undo(&sid("s2")).unwrap_err().code, ErrorCode::Validation);
    }

    #[test]
    fn test_entries_after_and_revert() {
        let h = History::new(100);
        let a = h.record(op("s", 1), Inverse::Nothing, None);
        let b = h.record(op("s", 2), Inverse::Nothing, None);
        let c = h.record(op("s", 3), Inverse::Nothing, None);
        let after: Vec<EntryId> =
            h.entries_after(&sid("s"), &a).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(after, vec![b.clone(), c.clone()]);
        h.mark_reverted(&sid("s"), &a).unwrap();
        assert_eq!(h.peek_redo(&sid("s")).unwrap().id, b);
        // b is now undone: reverting to it is a redo, not a revert.
        assert_eq!(h.entries_after(&sid("s"), &b).unwrap_err().code, ErrorCode::Validation);
        let journal = h.view(&sid("s")).journal;
        assert_eq!(journal.last().unwrap().fact, HistoryFact::Revert { target: a, undone: 2 });
    }

    #[test]
    fn test_stale_mark_rejected() {
        let h = History::new(100);
        let a = h.record(op("s", 1), Inverse::Nothing, None);
        h.record(op("s", 2), Inverse::Nothing, None);
        assert_eq!(h.mark_undone(&sid("s"), &a).unwrap_err().code, ErrorCode::Internal);
    }
}
