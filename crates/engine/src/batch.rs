//! Batch compiler.
//!
//! Packs units of requests into batchUpdate bodies under the byte ceiling.
//! A unit is the set of requests one operation (or one history entry)
//! compiled to; it is never split across batches. Order is preserved
//! end-to-end: batch k holds only units that precede those of batch k+1.

use gridrelay_core::{CoreError, Result};
use gridrelay_protocol::{BatchUpdateRequest, Request};

use crate::compiler::CompiledRequest;

/// Bytes of `{"requests":[` plus `]}`.
pub const ENVELOPE_BYTES: usize = 15;

/// Anything that carries one native request.
pub trait BatchItem {
    fn request(&self) -> &Request;
}

impl BatchItem for CompiledRequest {
    fn request(&self) -> &Request {
        &self.request
    }
}

impl BatchItem for Request {
    fn request(&self) -> &Request {
        self
    }
}

/// One unit placed in a batch, with its position in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchUnit<T> {
    pub index: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub units: Vec<BatchUnit<T>>,
    /// Exact serialized size of [`Batch::body`].
    pub bytes: usize,
}

impl<T: BatchItem> Batch<T> {
    fn new() -> Self {
        Self { units: Vec::new(), bytes: ENVELOPE_BYTES }
    }

    pub fn request_count(&self) -> usize {
        self.units.iter().map(|u| u.items.len()).sum()
    }

    pub fn body(&self) -> BatchUpdateRequest {
        BatchUpdateRequest {
            requests: self
                .units
                .iter()
                .flat_map(|u| u.items.iter().map(|i| i.request().clone()))
                .collect(),
        }
    }

    /// Size after appending `unit_bytes` bytes over `unit_len` requests.
    fn size_with(&self, unit_bytes: usize, unit_len: usize) -> usize {
        let existing = self.request_count();
        let commas = if existing == 0 { unit_len.saturating_sub(1) } else { unit_len };
        self.bytes + unit_bytes + commas
    }
}

/// Result of packing: the batches in dispatch order, plus units that could
/// not be placed at all.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan<T> {
    pub batches: Vec<Batch<T>>,
    pub rejected: Vec<(usize, CoreError)>,
}

impl<T> BatchPlan<T> {
    /// Batches beyond the first.
    pub fn splits(&self) -> usize {
        self.batches.len().saturating_sub(1)
    }
}

/// Serialized size of one request.
pub fn request_bytes(request: &Request) -> Result<usize> {
    serde_json::to_vec(request)
        .map(|b| b.len())
        .map_err(|e| CoreError::internal(format!("Cannot serialize {}: {}", request.kind(), e)))
}

/// Pack units greedily: when the next unit would push the open batch past
/// `limit`, seal it and open a new one. A unit that cannot fit even in an
/// empty batch is rejected with PAYLOAD_TOO_LARGE and does not affect the
/// others.
pub fn plan<T: BatchItem>(units: Vec<Vec<T>>, limit: usize) -> Result<BatchPlan<T>> {
    let mut batches = Vec::new();
    let mut rejected = Vec::new();
    let mut current = Batch::new();

    for (index, items) in units.into_iter().enumerate() {
        let mut unit_bytes = 0;
        for item in &items {
            unit_bytes += request_bytes(item.request())?;
        }
        let alone = ENVELOPE_BYTES + unit_bytes + items.len().saturating_sub(1);
        if alone > limit {
            log::debug!("unit {} is {} bytes, over the {} byte ceiling", index, alone, limit);
            rejected.push((index, CoreError::payload_too_large(alone, limit)));
            continue;
        }
        if !current.units.is_empty() && current.size_with(unit_bytes, items.len()) > limit {
            log::debug!(
                "sealing batch at {} bytes ({} requests)",
                current.bytes,
                current.request_count()
            );
            batches.push(std::mem::replace(&mut current, Batch::new()));
        }
        current.bytes = current.size_with(unit_bytes, items.len());
        current.units.push(BatchUnit { index, items });
    }
    if !current.units.is_empty() {
        batches.push(current);
    }
    Ok(BatchPlan { batches, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrelay_core::ErrorCode;
    use gridrelay_protocol::{DeleteSheetRequest, FindReplaceRequest};
    use proptest::prelude::*;

    fn sized(len: usize) -> Request {
        Request::FindReplace(FindReplaceRequest {
            find: "x".repeat(len),
            replacement: String::new(),
            match_case: false,
            match_entire_cell: false,
            search_by_regex: false,
            include_formulas: false,
            range: None,
            sheet_id: None,
            all_sheets: Some(true),
        })
    }

    #[test]
    fn test_bytes_match_serialized_body() {
        let units = vec![
            vec![Request::DeleteSheet(DeleteSheetRequest { sheet_id: 1 })],
            vec![sized(10), sized(20)],
        ];
        let plan = plan(units, 1_000_000).unwrap();
        assert_eq!(plan.batches.len(), 1);
        let body = serde_json::to_vec(&plan.batches[0].body()).unwrap();
        assert_eq!(plan.batches[0].bytes, body.len());
    }

    #[test]
    fn test_oversize_unit_rejected_alone() {
        let units = vec![vec![sized(10)], vec![sized(500)], vec![sized(10)]];
        let plan = plan(units, 300).unwrap();
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].0, 1);
        assert_eq!(plan.rejected[0].1.code, ErrorCode::PayloadTooLarge);
        let placed: Vec<usize> =
            plan.batches.iter().flat_map(|b| b.units.iter().map(|u| u.index)).collect();
        assert_eq!(placed, vec![0, 2]);
    }

    #[test]
    fn test_unit_never_split() {
        let one = request_bytes(&sized(50)).unwrap();
        // Room for three requests per batch, units of two.
        let limit = ENVELOPE_BYTES + 3 * one + 2;
        let units = vec![vec![sized(50), sized(50)], vec![sized(50), sized(50)]];
        let plan = plan(units, limit).unwrap();
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.splits(), 1);
        assert!(plan.batches.iter().all(|b| b.request_count() == 2));
    }

    proptest! {
        #[test]
        fn prop_batches_bounded_and_ordered(
            lens in proptest::collection::vec(1usize..400, 1..60),
            limit in 200usize..2000,
        ) {
            let units: Vec<Vec<Request>> = lens.iter().map(|&n| vec![sized(n)]).collect();
            let count = units.len();
            let plan = plan(units, limit).unwrap();
            let mut seen = Vec::new();
            for batch in &plan.batches {
                prop_assert!(batch.bytes <= limit);
                prop_assert_eq!(batch.bytes, serde_json::to_vec(&batch.body()).unwrap().len());
                seen.extend(batch.units.iter().map(|u| u.index));
            }
            let mut all: Vec<usize> = seen.clone();
            all.extend(plan.rejected.iter().map(|(i, _)| *i));
            all.sort_unstable();
            prop_assert_eq!(all, (0..count).collect::<Vec<_>>());
            prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
