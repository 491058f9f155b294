//! Response parser.
//!
//! The batchUpdate reply is an array positionally aligned with the request
//! list. Each compiled request states the reply shape it expects; replies
//! are mapped back per unit into typed payloads. Anything unrecognized
//! fails closed as INTERNAL rather than passing for success.

use gridrelay_core::{CoreError, Payload, Result};
use gridrelay_protocol::{
    AddBandingReply, AddNamedRangeReply, AddSheetReply, BatchUpdateResponse, DuplicateSheetReply,
    FindReplaceReply,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::batch::Batch;
use crate::compiler::CompiledRequest;

/// Reply shape a compiled request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyExpectation {
    /// `{}`; value writes report how many cells they covered.
    Empty { cells: Option<u64> },
    AddSheet,
    DuplicateSheet,
    FindReplace,
    AddNamedRange,
    AddBanding,
}

impl ReplyExpectation {
    pub const fn empty() -> Self {
        ReplyExpectation::Empty { cells: None }
    }
}

/// Map one reply object to a payload.
pub fn parse_reply(expect: ReplyExpectation, reply: &Value) -> Result<Payload> {
    match expect {
        ReplyExpectation::Empty { cells } => {
            let Some(obj) = reply.as_object() else {
                return Err(unrecognized("a reply object", reply));
            };
            if let Some(key) = obj.keys().next() {
                return Err(unrecognized(&format!("an empty reply, not '{}'", key), reply));
            }
            Ok(match cells {
                Some(updated_cells) => Payload::CellsUpdated { updated_cells },
                None => Payload::Applied,
            })
        }
        ReplyExpectation::AddSheet => {
            let r: AddSheetReply = extract(reply, "addSheet")?;
            Ok(Payload::SheetAdded {
                sheet_id: r.properties.sheet_id.unwrap_or_default(),
                title: r.properties.title.unwrap_or_default(),
                index: r.properties.index.unwrap_or_default(),
            })
        }
        ReplyExpectation::DuplicateSheet => {
            let r: DuplicateSheetReply = extract(reply, "duplicateSheet")?;
            Ok(Payload::SheetDuplicated {
                sheet_id: r.properties.sheet_id.unwrap_or_default(),
                title: r.properties.title.unwrap_or_default(),
                index: r.properties.index.unwrap_or_default(),
            })
        }
        ReplyExpectation::FindReplace => {
            let r: FindReplaceReply = extract(reply, "findReplace")?;
            Ok(Payload::Replaced {
                occurrences_changed: r.occurrences_changed,
                values_changed: r.values_changed,
                formulas_changed: r.formulas_changed,
                rows_changed: r.rows_changed,
                sheets_changed: r.sheets_changed,
            })
        }
        ReplyExpectation::AddNamedRange => {
            let r: AddNamedRangeReply = extract(reply, "addNamedRange")?;
            Ok(Payload::NamedRangeAdded {
                named_range_id: r.named_range.named_range_id.unwrap_or_default(),
                name: r.named_range.name,
            })
        }
        ReplyExpectation::AddBanding => {
            let r: AddBandingReply = extract(reply, "addBanding")?;
            let banded_range_id = r
                .banded_range
                .banded_range_id
                .ok_or_else(|| unrecognized("addBanding.bandedRange.bandedRangeId", reply))?;
            Ok(Payload::BandingAdded { banded_range_id })
        }
    }
}

/// Map a batch reply back to one result per unit, in unit order.
///
/// A reply array of the wrong length fails every unit: positions can no
/// longer be trusted.
pub fn parse_batch(
    batch: &Batch<CompiledRequest>,
    response: &BatchUpdateResponse,
) -> Vec<(usize, Result<Payload>)> {
    let expected = batch.request_count();
    if response.replies.len() != expected {
        log::warn!(
            "batch reply has {} entries for {} requests; failing the batch",
            response.replies.len(),
            expected
        );
        let err = CoreError::internal(format!(
            "Remote returned {} replies for {} requests",
            response.replies.len(),
            expected
        ));
        return fail_batch(batch, &err);
    }

    let mut replies = response.replies.iter();
    batch
        .units
        .iter()
        .map(|unit| {
            let parts: Result<Vec<Payload>> = unit
                .items
                .iter()
                .zip(replies.by_ref())
                .map(|(item, reply)| parse_reply(item.expect, reply))
                .collect();
            let payload = parts.map(|mut parts| match parts.len() {
                0 => Payload::Applied,
                1 => parts.remove(0),
                _ => Payload::Composite { parts },
            });
            (unit.index, payload)
        })
        .collect()
}

/// The same error for every unit of a failed batch.
pub fn fail_batch<T>(batch: &Batch<T>, error: &CoreError) -> Vec<(usize, Result<Payload>)> {
    batch.units.iter().map(|unit| (unit.index, Err(error.clone()))).collect()
}

// ── Internal helpers ────────────────────────────────────────────────

fn extract<T: DeserializeOwned>(reply: &Value, key: &str) -> Result<T> {
    let inner = reply.get(key).ok_or_else(|| unrecognized(key, reply))?;
    serde_json::from_value(inner.clone()).map_err(|e| {
        log::warn!("malformed {} reply: {}", key, e);
        CoreError::internal(format!("Malformed {} reply: {}", key, e))
    })
}

fn unrecognized(wanted: &str, reply: &Value) -> CoreError {
    log::warn!("unrecognized reply shape (wanted {}): {}", wanted, reply);
    CoreError::internal(format!("Unrecognized reply shape; expected {}", wanted))
}
