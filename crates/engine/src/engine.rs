//! Engine facade.
//!
//! Owns the shared components (quota, cache, dispatcher, transactions,
//! history, metrics) and runs operations through them. Reads go to the
//! independent values/metadata endpoints behind the cache. Every mutating
//! operation, direct or transactional, goes through one pipeline:
//!
//! 1. Metadata preflight, then conflict checks against fresh reads
//! 2. Compile against a metadata model to learn which grid data the inverse
//!    capture needs, and read exactly that
//! 3. Replay the compiled requests on the model, capturing inverses
//! 4. Pack into batches and dispatch them in order
//! 5. Parse replies back into one result per operation
//!
//! Mutations on one spreadsheet are serialized by a per-spreadsheet gate so
//! the model a commit is replayed on cannot be invalidated by our own
//! concurrent writes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use gridrelay_config::EngineConfig;
use gridrelay_core::{
    normalize, A1Range, CoreError, EntryId, ErrorCode, NormalizedOp, Operation, OperationId,
    OperationResult, Params, Payload, Result, SheetSummary, SpreadsheetId, TransactionId,
};
use gridrelay_protocol::{GridRange, Request, SheetId, SheetsApi, SpreadsheetQuery};
use parking_lot::Mutex;
use serde::Serialize;

use crate::batch::{self, Batch, BatchItem};
use crate::cache::{CacheKey, DiffMode, ReadCache};
use crate::clock::{Clock, RealClock};
use crate::compiler::{self, CompiledRequest};
use crate::conflict::{self, Verdict};
use crate::dispatch::Dispatcher;
use crate::history::{History, HistoryView};
use crate::inverse::{self, Inverse};
use crate::metrics::{EngineSnapshot, Metrics};
use crate::model::WorkbookModel;
use crate::parser;
use crate::quota::QuotaManager;
use crate::revision;
use crate::transaction::{TransactionManager, TransactionState, TransactionStatus};

/// Past this many distinct ranges a preflight reads whole sheets instead.
const MAX_PREFLIGHT_RANGES: usize = 50;

// ============================================================================
// Public result types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub transaction_id: TransactionId,
    pub state: TransactionState,
    /// One per queued operation, in queue order.
    pub results: Vec<OperationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Dropped from an open transaction's queue.
    RemovedFromTransaction { transaction_id: TransactionId },
    /// Waiting for dispatch; it will fail CANCELLED instead of being sent.
    Flagged,
    /// Already claimed for dispatch. It runs to completion or its timeout.
    TooLate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Undo,
    Redo,
    Revert,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMove {
    pub spreadsheet_id: SpreadsheetId,
    pub direction: Direction,
    /// Undo/redo: the entry moved over. Revert: the target.
    pub entry_id: EntryId,
    /// Entries whose effect was reversed or re-applied.
    pub entries: usize,
    pub batches: usize,
}

// ============================================================================
// Pipeline internals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// All or nothing: the first failure fails every operation.
    Atomic,
    /// Each operation stands alone.
    Independent,
}

/// Outcome of one mutating operation.
struct Applied {
    op: NormalizedOp,
    outcome: Result<Payload>,
    /// Set when the operation applied remotely.
    inverse: Option<Inverse>,
}

type Settled = (usize, Result<Payload>, Option<Inverse>);

/// One pass over the not-yet-settled operations.
#[derive(Default)]
struct Round {
    settled: Vec<Settled>,
    /// Operations to run again against fresh state (independent mode, after
    /// an earlier batch failed).
    retry: Vec<usize>,
}

impl Round {
    fn abort(indices: &[usize], err: &CoreError) -> Self {
        Round {
            settled: indices.iter().map(|&i| (i, Err(err.clone()), None)).collect(),
            retry: Vec::new(),
        }
    }
}

/// An operation compiled and replayed, ready to batch.
struct Prepared {
    index: usize,
    requests: Vec<CompiledRequest>,
    inverse: Inverse,
}

/// What grid data an inverse capture needs.
enum Touch {
    Range(GridRange),
    Sheet(SheetId),
    AllSheets,
}

/// Keeps operation ids cancellable while they wait for dispatch.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<OperationId>>,
    cancelled: &'a Mutex<HashSet<OperationId>>,
    claimed: &'a Mutex<HashSet<OperationId>>,
    ids: Vec<OperationId>,
}

impl<'a> PendingGuard<'a> {
    fn new(engine: &'a Engine, ids: Vec<OperationId>) -> Self {
        engine.pending.lock().extend(ids.iter().cloned());
        Self {
            pending: &engine.pending,
            cancelled: &engine.cancelled,
            claimed: &engine.claimed,
            ids,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        let mut cancelled = self.cancelled.lock();
        let mut claimed = self.claimed.lock();
        for id in &self.ids {
            pending.remove(id);
            cancelled.remove(id);
            claimed.remove(id);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    config: EngineConfig,
    quota: Arc<QuotaManager>,
    cache: ReadCache,
    dispatcher: Dispatcher,
    transactions: TransactionManager,
    history: History,
    metrics: Metrics,
    gates: Mutex<HashMap<SpreadsheetId, Arc<smol::lock::Mutex<()>>>>,
    pending: Mutex<HashSet<OperationId>>,
    cancelled: Mutex<HashSet<OperationId>>,
    /// Pending ops past the cancellation checkpoint of their round.
    claimed: Mutex<HashSet<OperationId>>,
}

impl Engine {
    pub fn new(config: EngineConfig, api: Arc<dyn SheetsApi>) -> Self {
        Self::with_clock(config, api, Arc::new(RealClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        api: Arc<dyn SheetsApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let quota = Arc::new(QuotaManager::new(&config.quota, clock.clone()));
        Self {
            cache: ReadCache::new(&config.cache, clock.clone()),
            dispatcher: Dispatcher::new(api, quota.clone(), config.dispatch.clone()),
            transactions: TransactionManager::new(&config.transactions, clock),
            history: History::new(config.history.capacity),
            metrics: Metrics::new(),
            gates: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            claimed: Mutex::new(HashSet::new()),
            quota,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    // ------------------------------------------------------------------------
    // Direct path
    // ------------------------------------------------------------------------

    /// Run one operation. An operation carrying a transaction id is queued
    /// instead.
    pub async fn execute(&self, op: Operation) -> OperationResult {
        let mut results = self.execute_many(vec![op]).await;
        results
            .pop()
            .unwrap_or_else(|| OperationResult::err(OperationId::new(), unsettled()))
    }

    /// Run one logical submission. Results come back one per operation in
    /// submission order; a failing operation does not block the others.
    /// Mutations are batched per spreadsheet; a read first flushes the
    /// mutations queued ahead of it on the same spreadsheet.
    pub async fn execute_many(&self, ops: Vec<Operation>) -> Vec<OperationResult> {
        let ids: Vec<OperationId> = ops.iter().map(|op| op.id.clone()).collect();
        let mut results: Vec<Option<OperationResult>> = vec![None; ops.len()];
        // Queued ops are counted when their transaction commits.
        let mut queued = HashSet::new();
        // Mutations waiting to be flushed, per spreadsheet, in arrival order.
        let mut waiting: Vec<(SpreadsheetId, Vec<(usize, NormalizedOp)>)> = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            let nop = match normalize(op) {
                Ok(nop) => nop,
                Err(e) => {
                    results[i] = Some(OperationResult::err(op.id.clone(), e));
                    continue;
                }
            };
            if let Some(txn) = nop.transaction_id.clone() {
                let result = self
                    .transactions
                    .queue(&txn, nop)
                    .map(|position| Payload::Queued { transaction_id: txn, position });
                if result.is_ok() {
                    queued.insert(i);
                }
                results[i] = Some(to_result(op.id.clone(), result));
                continue;
            }
            if nop.action.is_mutating() {
                match waiting.iter_mut().find(|(s, _)| *s == nop.spreadsheet_id) {
                    Some((_, group)) => group.push((i, nop)),
                    None => waiting.push((nop.spreadsheet_id.clone(), vec![(i, nop)])),
                }
                continue;
            }
            if let Some(pos) = waiting.iter().position(|(s, _)| *s == nop.spreadsheet_id) {
                let (sheet, group) = waiting.remove(pos);
                self.flush(&sheet, group, &mut results).await;
            }
            results[i] = Some(to_result(nop.id.clone(), self.read(&nop).await));
        }
        for (sheet, group) in waiting {
            self.flush(&sheet, group, &mut results).await;
        }

        results
            .into_iter()
            .zip(ids)
            .enumerate()
            .map(|(i, (result, id))| {
                let result = result.unwrap_or_else(|| OperationResult::err(id, unsettled()));
                if !queued.contains(&i) {
                    self.metrics.outcome(result.outcome_label());
                }
                result
            })
            .collect()
    }

    /// Withdraw an operation that has not been dispatched yet.
    pub fn cancel(&self, op_id: &OperationId) -> Result<CancelOutcome> {
        if let Some(transaction_id) = self.transactions.cancel_op(op_id) {
            return Ok(CancelOutcome::RemovedFromTransaction { transaction_id });
        }
        if self.pending.lock().contains(op_id) {
            let mut cancelled = self.cancelled.lock();
            if self.claimed.lock().contains(op_id) {
                log::debug!("{} is already being dispatched", op_id);
                return Ok(CancelOutcome::TooLate);
            }
            cancelled.insert(op_id.clone());
            log::debug!("{} flagged for cancellation", op_id);
            return Ok(CancelOutcome::Flagged);
        }
        Err(CoreError::not_found(format!("No pending operation {}", op_id)))
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    pub fn begin(&self, spreadsheet_id: impl Into<SpreadsheetId>) -> TransactionId {
        self.transactions.begin(&spreadsheet_id.into())
    }

    /// Queue an operation (its own transaction id, if any, is ignored).
    pub fn queue(&self, transaction_id: &TransactionId, op: Operation) -> Result<usize> {
        let mut nop = normalize(&op)?;
        nop.transaction_id = Some(transaction_id.clone());
        self.transactions.queue(transaction_id, nop)
    }

    /// Check, compile, dispatch and parse every queued operation as one
    /// atomic unit.
    pub async fn commit(&self, transaction_id: &TransactionId) -> Result<CommitReport> {
        let (sheet, ops) = self.transactions.start_commit(transaction_id)?;
        let claim = self.transactions.guard_commit(transaction_id);
        let applied = if ops.is_empty() {
            Vec::new()
        } else {
            self.run_mutations(&sheet, ops, Mode::Atomic).await
        };

        let error = applied
            .iter()
            .filter_map(|a| a.outcome.as_ref().err())
            .find(|e| e.code != ErrorCode::Cancelled)
            .cloned();
        claim.finish(error.clone());
        if error.is_none() {
            self.record_history(&applied);
        }

        let results: Vec<OperationResult> = applied
            .into_iter()
            .map(|a| {
                let result = to_result(a.op.id, a.outcome);
                self.metrics.outcome(result.outcome_label());
                result
            })
            .collect();
        Ok(CommitReport {
            transaction_id: transaction_id.clone(),
            state: match error {
                Some(_) => TransactionState::Aborted,
                None => TransactionState::Committed,
            },
            results,
            error,
        })
    }

    pub fn rollback(&self, transaction_id: &TransactionId) -> Result<()> {
        self.transactions.rollback(transaction_id)
    }

    pub fn status(&self, transaction_id: &TransactionId) -> Result<TransactionStatus> {
        self.transactions.status(transaction_id)
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    /// Reverse the most recent applied entry.
    pub async fn undo(&self, spreadsheet_id: &SpreadsheetId) -> Result<HistoryMove> {
        let gate = self.gate(spreadsheet_id);
        let _gate = gate.lock().await;

        let entry = self.history.peek_undo(spreadsheet_id)?;
        let requests = entry.inverse.to_requests()?;
        let count = requests.len();
        let batches = self.send_units(spreadsheet_id, vec![requests]).await?;
        self.history.mark_undone(spreadsheet_id, &entry.id)?;
        log::info!("undo {} on {} ({} requests)", entry.id, spreadsheet_id, count);
        Ok(HistoryMove {
            spreadsheet_id: spreadsheet_id.clone(),
            direction: Direction::Undo,
            entry_id: entry.id,
            entries: 1,
            batches,
        })
    }

    /// Re-apply the entry after the cursor. Its inverse is captured afresh.
    pub async fn redo(&self, spreadsheet_id: &SpreadsheetId) -> Result<HistoryMove> {
        let gate = self.gate(spreadsheet_id);
        let _gate = gate.lock().await;

        let entry = self.history.peek_redo(spreadsheet_id)?;
        let mut forward = entry.forward.clone();
        // The caller's baseline described the state before the first run.
        forward.baseline_revision = None;
        let before = self.metrics.batches().dispatched;
        let applied = self.run_locked(spreadsheet_id, vec![forward], Mode::Atomic).await;
        let Some(Applied { outcome, inverse, .. }) = applied.into_iter().next() else {
            return Err(CoreError::internal("Redo produced no result"));
        };
        outcome?;
        self.history.mark_redone(spreadsheet_id, &entry.id, inverse.unwrap_or(Inverse::Nothing))?;
        log::info!("redo {} on {}", entry.id, spreadsheet_id);
        Ok(HistoryMove {
            spreadsheet_id: spreadsheet_id.clone(),
            direction: Direction::Redo,
            entry_id: entry.id,
            entries: 1,
            batches: (self.metrics.batches().dispatched - before) as usize,
        })
    }

    /// Reverse every applied entry after `target`, newest first, in as few
    /// batches as fit (one batch, hence atomic, whenever possible).
    pub async fn revert_to(
        &self,
        spreadsheet_id: &SpreadsheetId,
        target: &EntryId,
    ) -> Result<HistoryMove> {
        let gate = self.gate(spreadsheet_id);
        let _gate = gate.lock().await;

        let entries = self.history.entries_after(spreadsheet_id, target)?;
        let mut units = Vec::with_capacity(entries.len());
        let mut owners = Vec::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            units.push(entry.inverse.to_requests()?);
            owners.push(entry.id.clone());
        }
        let total: usize = units.iter().map(Vec::len).sum();
        let plan = batch::plan(units, self.dispatcher.batch_limit())?;
        if let Some((_, err)) = plan.rejected.into_iter().next() {
            return Err(err);
        }
        if plan.batches.len() > 1 {
            log::warn!(
                "revert of {} entries on {} needs {} batches; it is not atomic",
                owners.len(),
                spreadsheet_id,
                plan.batches.len()
            );
        }
        for (k, batch) in plan.batches.iter().enumerate() {
            if let Err(e) = self.send(spreadsheet_id, batch).await {
                // Entries in the batches that did apply are undone.
                for done in &plan.batches[..k] {
                    for unit in &done.units {
                        self.history.mark_undone(spreadsheet_id, &owners[unit.index])?;
                    }
                }
                return Err(e);
            }
        }
        self.history.mark_reverted(spreadsheet_id, target)?;
        log::info!(
            "reverted {} to {} ({} entries, {} requests)",
            spreadsheet_id,
            target,
            owners.len(),
            total
        );
        Ok(HistoryMove {
            spreadsheet_id: spreadsheet_id.clone(),
            direction: Direction::Revert,
            entry_id: target.clone(),
            entries: owners.len(),
            batches: plan.batches.iter().filter(|b| b.request_count() > 0).count(),
        })
    }

    pub fn history(&self, spreadsheet_id: &SpreadsheetId) -> HistoryView {
        self.history.view(spreadsheet_id)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            quota: self.quota.snapshot(),
            cache: self.cache.snapshot(),
            batches: self.metrics.batches(),
            outcomes: self.metrics.outcomes(),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn read(&self, op: &NormalizedOp) -> Result<Payload> {
        let sheet = &op.spreadsheet_id;
        match &op.params {
            Params::ReadRange(p) => {
                let a1 = p.range.to_a1();
                let key = CacheKey::new(sheet, a1.clone(), p.render.into());
                self.cache
                    .get_or_fetch(key, || async {
                        let live = self.dispatcher.get_values(sheet, &a1, p.render).await?;
                        let revision = revision::revision(p.render, &live.values);
                        Ok(Payload::Values { range: live.range, values: live.values, revision })
                    })
                    .await
            }
            Params::GetMetadata(p) => {
                let ranges: Vec<String> = p.ranges.iter().map(A1Range::to_a1).collect();
                let mode = if p.include_grid_data { DiffMode::Full } else { DiffMode::Metadata };
                let resource = if ranges.is_empty() { "*".to_string() } else { ranges.join(",") };
                let query = if p.include_grid_data {
                    SpreadsheetQuery::grid(ranges)
                } else {
                    SpreadsheetQuery::metadata()
                };
                self.cache
                    .get_or_fetch(CacheKey::new(sheet, resource, mode), || async {
                        let book = self.dispatcher.get_spreadsheet(sheet, query).await?;
                        metadata_payload(&book, p.include_grid_data)
                    })
                    .await
            }
            _ => Err(CoreError::internal(format!("{} is not a read", op.action.label()))),
        }
    }

    // ========================================================================
    // Mutation pipeline
    // ========================================================================

    async fn flush(
        &self,
        sheet: &SpreadsheetId,
        group: Vec<(usize, NormalizedOp)>,
        results: &mut [Option<OperationResult>],
    ) {
        let (slots, ops): (Vec<usize>, Vec<NormalizedOp>) = group.into_iter().unzip();
        let applied = self.run_mutations(sheet, ops, Mode::Independent).await;
        self.record_history(&applied);
        for (slot, a) in slots.into_iter().zip(applied) {
            results[slot] = Some(to_result(a.op.id, a.outcome));
        }
    }

    fn record_history(&self, applied: &[Applied]) {
        for a in applied {
            if let (Ok(_), Some(inverse)) = (&a.outcome, &a.inverse) {
                self.history.record(a.op.clone(), inverse.clone(), a.op.transaction_id.clone());
            }
        }
    }

    fn gate(&self, sheet: &SpreadsheetId) -> Arc<smol::lock::Mutex<()>> {
        self.gates.lock().entry(sheet.clone()).or_default().clone()
    }

    /// Cancellation checkpoint: a flagged op is dropped (true), any other
    /// is claimed for dispatch and can no longer be cancelled.
    fn take_cancelled(&self, id: &OperationId) -> bool {
        let mut cancelled = self.cancelled.lock();
        if cancelled.remove(id) {
            return true;
        }
        self.claimed.lock().insert(id.clone());
        false
    }

    async fn run_mutations(
        &self,
        sheet: &SpreadsheetId,
        ops: Vec<NormalizedOp>,
        mode: Mode,
    ) -> Vec<Applied> {
        let _pending = PendingGuard::new(self, ops.iter().map(|op| op.id.clone()).collect());
        let gate = self.gate(sheet);
        let _gate = gate.lock().await;
        self.run_locked(sheet, ops, mode).await
    }

    /// Run under the spreadsheet gate. Independent mode re-runs operations
    /// stranded behind a failed batch against fresh state.
    async fn run_locked(
        &self,
        sheet: &SpreadsheetId,
        ops: Vec<NormalizedOp>,
        mode: Mode,
    ) -> Vec<Applied> {
        let mut outcomes: Vec<Option<(Result<Payload>, Option<Inverse>)>> = vec![None; ops.len()];
        let mut remaining: Vec<usize> = (0..ops.len()).collect();
        while !remaining.is_empty() {
            let round = self.round(sheet, &ops, &remaining, mode).await;
            if round.settled.is_empty() {
                // No progress; never loop forever.
                let err = CoreError::internal("Mutation pipeline made no progress");
                for &i in &remaining {
                    outcomes[i] = Some((Err(err.clone()), None));
                }
                break;
            }
            for (i, outcome, inverse) in round.settled {
                outcomes[i] = Some((outcome, inverse));
            }
            // Re-planned ops wait again and may still be cancelled.
            let mut claimed = self.claimed.lock();
            for &i in &round.retry {
                claimed.remove(&ops[i].id);
            }
            drop(claimed);
            remaining = round.retry;
        }
        ops.into_iter()
            .zip(outcomes)
            .map(|(op, slot)| {
                let (outcome, inverse) = slot.unwrap_or_else(|| (Err(unsettled()), None));
                Applied { op, outcome, inverse }
            })
            .collect()
    }

    async fn round(
        &self,
        sheet: &SpreadsheetId,
        ops: &[NormalizedOp],
        indices: &[usize],
        mode: Mode,
    ) -> Round {
        let mut round = Round::default();

        let mut live = Vec::with_capacity(indices.len());
        for &i in indices {
            if self.take_cancelled(&ops[i].id) {
                log::debug!("{} cancelled before dispatch", ops[i].id);
                round.settled.push((i, Err(CoreError::cancelled(ops[i].id.as_str())), None));
            } else {
                live.push(i);
            }
        }
        if live.is_empty() {
            return round;
        }

        // 1. Preflight and conflicts.
        let meta = self.dispatcher.get_spreadsheet(sheet, SpreadsheetQuery::metadata()).await;
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => return Round::abort(indices, &e),
        };
        let mut book = WorkbookModel::from_spreadsheet(&meta);

        let mut checked = Vec::with_capacity(live.len());
        for i in live {
            match conflict::check(&ops[i], &book, &self.dispatcher).await {
                Ok(Verdict::Proceed) => checked.push(i),
                Ok(Verdict::Skip { reason }) => {
                    round.settled.push((i, Ok(Payload::Skipped { reason }), None))
                }
                Err(e) if mode == Mode::Atomic => return Round::abort(indices, &e),
                Err(e) => round.settled.push((i, Err(e), None)),
            }
        }

        // 2. Find and read the grid data the replay needs.
        let (checked, failed, touches) = plan_touches(ops, &checked, &book);
        if let Some((_, e)) = failed.first().filter(|_| mode == Mode::Atomic) {
            return Round::abort(indices, e);
        }
        round.settled.extend(failed.into_iter().map(|(i, e)| (i, Err(e), None)));
        let ranges = preflight_ranges(&touches, &book);
        if !ranges.is_empty() {
            log::debug!("preflight of {} reads {} ranges", sheet, ranges.len());
            match self.dispatcher.get_spreadsheet(sheet, SpreadsheetQuery::grid(ranges)).await {
                Ok(grid) => book.load_grid(&grid),
                Err(e) => return Round::abort(indices, &e),
            }
        }

        // 3. Replay for inverses, then pack. An oversize unit is dropped and
        //    the rest replayed again without it.
        let mut candidates = checked;
        let (prepared, plan) = loop {
            let (prepared, failed) = replay(ops, &candidates, &book);
            if let Some((_, e)) = failed.first().filter(|_| mode == Mode::Atomic) {
                return Round::abort(indices, e);
            }
            round.settled.extend(failed.into_iter().map(|(i, e)| (i, Err(e), None)));

            let units: Vec<Vec<CompiledRequest>> =
                prepared.iter().map(|p| p.requests.clone()).collect();
            let plan = match batch::plan(units, self.dispatcher.batch_limit()) {
                Ok(plan) => plan,
                Err(e) => return Round::abort(indices, &e),
            };
            if plan.rejected.is_empty() {
                break (prepared, plan);
            }
            if mode == Mode::Atomic {
                return Round::abort(indices, &plan.rejected[0].1);
            }
            let rejected: HashSet<usize> =
                plan.rejected.iter().map(|(u, _)| prepared[*u].index).collect();
            for (u, e) in plan.rejected {
                round.settled.push((prepared[u].index, Err(e), None));
            }
            candidates = prepared
                .iter()
                .map(|p| p.index)
                .filter(|i| !rejected.contains(i))
                .collect();
        };
        if prepared.is_empty() {
            return round;
        }

        if mode == Mode::Atomic && plan.batches.len() > 1 {
            if let Some(p) = prepared.iter().find(|p| !p.inverse.is_reversible()) {
                let err = CoreError::validation(format!(
                    "{} cannot be undone, so a commit spanning {} batches could not be rolled back",
                    ops[p.index].action.label(),
                    plan.batches.len()
                ));
                return Round::abort(indices, &err);
            }
        }
        self.metrics.batches_split(plan.splits());

        // 4-5. Dispatch in order and parse.
        let mut applied: Vec<&Batch<CompiledRequest>> = Vec::new();
        for (k, batch) in plan.batches.iter().enumerate() {
            let outcome = match self.send(sheet, batch).await {
                Ok(response) => {
                    let parsed = parser::parse_batch(batch, &response);
                    applied.push(batch);
                    match parsed.iter().find_map(|(_, r)| r.as_ref().err()) {
                        Some(e) if mode == Mode::Atomic => Err(e.clone()),
                        _ => Ok(parsed),
                    }
                }
                Err(e) => Err(e),
            };

            match (outcome, mode) {
                (Ok(parsed), _) => {
                    for (u, result) in parsed {
                        let p = &prepared[u];
                        let inverse = result.is_ok().then(|| p.inverse.clone());
                        round.settled.push((p.index, result, inverse));
                    }
                }
                (Err(mut e), Mode::Atomic) => {
                    if e.code == ErrorCode::Timeout {
                        match self.landed(sheet, &book, &applied, batch, &prepared).await {
                            Ok(true) => applied.push(batch),
                            Ok(false) => {}
                            Err(unknown) => e = unknown,
                        }
                    }
                    let e = self.compensate(sheet, &applied, &prepared).await.err().unwrap_or(e);
                    return Round::abort(indices, &e);
                }
                (Err(e), Mode::Independent) => {
                    for unit in &batch.units {
                        round.settled.push((prepared[unit.index].index, Err(e.clone()), None));
                    }
                    round.retry = plan.batches[k + 1..]
                        .iter()
                        .flat_map(|b| b.units.iter().map(|u| prepared[u.index].index))
                        .collect();
                    if !round.retry.is_empty() {
                        log::warn!(
                            "{} operations on {} re-planned after a failed batch",
                            round.retry.len(),
                            sheet
                        );
                    }
                    return round;
                }
            }
        }
        round
    }

    /// Whether a timed-out batch was applied anyway. `book` is the state
    /// before the round, `applied` the batches that went through since.
    ///
    /// Batches that change the workbook's structure are told apart by a
    /// fresh metadata read. Cell-only batches are assumed applied: their
    /// inverses restore the prior cells, which is a no-op if they never
    /// landed. Anything else is reported as unknown (INTERNAL).
    async fn landed(
        &self,
        sheet: &SpreadsheetId,
        book: &WorkbookModel,
        applied: &[&Batch<CompiledRequest>],
        batch: &Batch<CompiledRequest>,
        prepared: &[Prepared],
    ) -> Result<bool> {
        let mut before = book.clone();
        for earlier in applied {
            before.apply_all(&requests_of(earlier))?;
        }
        let mut after = before.clone();
        after.apply_all(&requests_of(batch))?;
        let (before, after) = (shape_of(&before), shape_of(&after));

        let unknown = |why: &str| {
            log::error!("timed-out batch on {} has an unknown outcome: {}", sheet, why);
            CoreError::internal(format!(
                "A batch on {} timed out and whether it applied could not be determined ({}); \
                 the spreadsheet may be partially changed",
                sheet, why
            ))
        };
        if before == after {
            if batch.units.iter().all(|u| prepared[u.index].inverse.is_idempotent()) {
                return Ok(true);
            }
            return Err(unknown("its effect is not visible in metadata"));
        }
        let remote = self.dispatcher.get_spreadsheet(sheet, SpreadsheetQuery::metadata()).await;
        let remote = match remote {
            Ok(remote) => shape_of(&WorkbookModel::from_spreadsheet(&remote)),
            Err(e) => return Err(unknown(&e.message)),
        };
        if remote == after {
            log::warn!("timed-out batch on {} was applied", sheet);
            Ok(true)
        } else if remote == before {
            Ok(false)
        } else {
            Err(unknown("the spreadsheet matches neither outcome"))
        }
    }

    /// Undo already-applied batches of a failed atomic commit, newest first.
    async fn compensate(
        &self,
        sheet: &SpreadsheetId,
        applied: &[&Batch<CompiledRequest>],
        prepared: &[Prepared],
    ) -> Result<()> {
        if applied.is_empty() {
            return Ok(());
        }
        let mut units = Vec::new();
        for batch in applied.iter().rev() {
            for unit in batch.units.iter().rev() {
                units.push(prepared[unit.index].inverse.to_requests()?);
            }
        }
        log::warn!("compensating {} applied batches on {}", applied.len(), sheet);
        let result = self.send_units(sheet, units).await;
        if let Err(e) = &result {
            log::error!(
                "compensation on {} failed; remote state is partially applied: {}",
                sheet,
                e
            );
        }
        result.map(|_| ()).map_err(|e| {
            CoreError::internal(format!(
                "Commit failed and could not be rolled back on {}: {}",
                sheet, e.message
            ))
        })
    }

    /// Pack request units and send them in order; returns the batches sent.
    async fn send_units(&self, sheet: &SpreadsheetId, units: Vec<Vec<Request>>) -> Result<usize> {
        let plan = batch::plan(units, self.dispatcher.batch_limit())?;
        if let Some((_, err)) = plan.rejected.into_iter().next() {
            return Err(err);
        }
        let mut sent = 0;
        for batch in &plan.batches {
            if batch.request_count() > 0 {
                self.send(sheet, batch).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    async fn send<T: BatchItem>(
        &self,
        sheet: &SpreadsheetId,
        batch: &Batch<T>,
    ) -> Result<gridrelay_protocol::BatchUpdateResponse> {
        if batch.request_count() == 0 {
            return Ok(gridrelay_protocol::BatchUpdateResponse {
                spreadsheet_id: sheet.to_string(),
                replies: Vec::new(),
            });
        }
        self.metrics.batch_dispatched(batch.bytes);
        log::debug!(
            "dispatching {} requests ({} bytes) to {}",
            batch.request_count(),
            batch.bytes,
            sheet
        );
        let result = self.dispatcher.batch_update(sheet, batch.body()).await;
        // A timed-out batch may still have landed.
        self.cache.invalidate(sheet);
        result
    }
}

// ============================================================================
// Internal helpers
// ============================================================================

fn unsettled() -> CoreError {
    CoreError::internal("Operation produced no result")
}

fn requests_of(batch: &Batch<CompiledRequest>) -> Vec<Request> {
    batch.units.iter().flat_map(|u| u.items.iter().map(|c| c.request.clone())).collect()
}

/// A workbook's structure without cell data.
fn shape_of(book: &WorkbookModel) -> gridrelay_protocol::Spreadsheet {
    book.to_spreadsheet("", None)
}

fn to_result(id: OperationId, outcome: Result<Payload>) -> OperationResult {
    match outcome {
        Ok(payload) => OperationResult::ok(id, payload),
        Err(e) => OperationResult::err(id, e),
    }
}

/// Pass one: compile each operation against an evolving metadata model and
/// note what grid data its inverse capture will read.
fn plan_touches(
    ops: &[NormalizedOp],
    indices: &[usize],
    book: &WorkbookModel,
) -> (Vec<usize>, Vec<(usize, CoreError)>, Vec<Touch>) {
    let mut shape = book.clone();
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    let mut touches = Vec::new();
    for &i in indices {
        let compiled = compiler::compile(&ops[i], &shape).and_then(|reqs| {
            let requests: Vec<Request> = reqs.into_iter().map(|c| c.request).collect();
            shape.apply_all(&requests)?;
            Ok(requests)
        });
        match compiled {
            Ok(requests) => {
                touches.extend(requests.iter().filter_map(touch_of));
                ok.push(i);
            }
            Err(e) => failed.push((i, e)),
        }
    }
    (ok, failed, touches)
}

fn touch_of(request: &Request) -> Option<Touch> {
    match request {
        Request::UpdateCells(r) => Some(Touch::Range(r.range.clone())),
        Request::RepeatCell(r) => Some(Touch::Range(r.range.clone())),
        Request::AppendCells(r) => Some(Touch::Sheet(r.sheet_id)),
        Request::InsertDimension(r) => Some(Touch::Sheet(r.range.sheet_id)),
        Request::DeleteDimension(r) => Some(Touch::Sheet(r.range.sheet_id)),
        Request::MoveDimension(r) => Some(Touch::Sheet(r.source.sheet_id)),
        Request::DuplicateSheet(r) => Some(Touch::Sheet(r.source_sheet_id)),
        Request::FindReplace(r) => match (&r.range, r.sheet_id) {
            (Some(range), _) => Some(Touch::Range(range.clone())),
            (None, Some(sheet_id)) => Some(Touch::Sheet(sheet_id)),
            (None, None) => Some(Touch::AllSheets),
        },
        _ => None,
    }
}

/// A1 ranges to read so every touched cell is in the model. Sheets that
/// get reshaped are read whole: later coordinates on them have shifted.
fn preflight_ranges(touches: &[Touch], book: &WorkbookModel) -> Vec<String> {
    let mut whole: BTreeSet<SheetId> = BTreeSet::new();
    let mut ranges: Vec<&GridRange> = Vec::new();
    for touch in touches {
        match touch {
            Touch::Range(range) => ranges.push(range),
            Touch::Sheet(id) => {
                whole.insert(*id);
            }
            Touch::AllSheets => whole.extend(book.sheets().iter().map(|s| s.sheet_id)),
        }
    }
    ranges.retain(|r| !whole.contains(&r.sheet_id));
    if ranges.len() > MAX_PREFLIGHT_RANGES {
        whole.extend(ranges.drain(..).map(|r| r.sheet_id));
    }

    let mut out: Vec<String> = whole
        .iter()
        .filter_map(|id| book.sheet(*id).ok())
        .map(|s| A1Range::whole_sheet(&s.title).to_a1())
        .collect();
    let mut seen = HashSet::new();
    for range in ranges {
        let Ok(sheet) = book.sheet(range.sheet_id) else {
            // Created earlier in this submission; nothing to read.
            continue;
        };
        let a1 = A1Range {
            sheet: Some(sheet.title.clone()),
            start_row: range.start_row_index,
            end_row: range.end_row_index,
            start_col: range.start_column_index,
            end_col: range.end_column_index,
        }
        .to_a1();
        if seen.insert(a1.clone()) {
            out.push(a1);
        }
    }
    out
}

/// Pass two: compile against the grid-loaded model and apply, capturing
/// each operation's inverse from the state it will overwrite.
fn replay(
    ops: &[NormalizedOp],
    indices: &[usize],
    book: &WorkbookModel,
) -> (Vec<Prepared>, Vec<(usize, CoreError)>) {
    let mut model = book.clone();
    let mut prepared = Vec::with_capacity(indices.len());
    let mut failed = Vec::new();
    for &i in indices {
        let outcome = compiler::compile(&ops[i], &model).and_then(|requests| {
            let inverse =
                inverse::apply_capturing(&mut model, requests.iter().map(|c| &c.request))?;
            Ok((requests, inverse))
        });
        match outcome {
            Ok((requests, inverse)) => prepared.push(Prepared { index: i, requests, inverse }),
            Err(e) => failed.push((i, e)),
        }
    }
    (prepared, failed)
}

fn metadata_payload(book: &gridrelay_protocol::Spreadsheet, with_grid: bool) -> Result<Payload> {
    let sheets = book
        .sheets
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let p = &s.properties;
            let grid = p.grid_properties.clone().unwrap_or_default();
            SheetSummary {
                sheet_id: p.sheet_id.unwrap_or_default(),
                title: p.title.clone().unwrap_or_default(),
                index: p.index.unwrap_or(i as u32),
                row_count: grid.row_count.unwrap_or_default(),
                column_count: grid.column_count.unwrap_or_default(),
                frozen_row_count: grid.frozen_row_count.unwrap_or_default(),
            }
        })
        .collect();
    let grid = if with_grid {
        let data = serde_json::to_value(&book.sheets)
            .map_err(|e| CoreError::internal(format!("Cannot encode grid data: {}", e)))?;
        Some(data)
    } else {
        None
    };
    Ok(Payload::Metadata {
        title: book.properties.title.clone(),
        sheets,
        named_ranges: book.named_ranges.iter().map(|n| n.name.clone()).collect(),
        grid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::FakeSheets;
    use gridrelay_core::ErrorCode;
    use serde_json::json;

    fn engine() -> (Arc<FakeSheets>, Engine) {
        let fake = Arc::new(FakeSheets::with_default_book("s"));
        (fake.clone(), Engine::new(EngineConfig::default(), fake))
    }

    #[test]
    fn test_write_then_read() {
        let (_fake, engine) = engine();
        smol::block_on(async {
            let params = json!({"range": "A1:B2", "values": [[1, 2], [3, 4]]});
            let write = engine.execute(Operation::new("s", "write_range", params)).await;
            assert_eq!(write.payload, Some(Payload::CellsUpdated { updated_cells: 4 }));
            let read = engine
                .execute(Operation::new("s", "read_range", json!({"range": "A1:B2"})))
                .await;
            match read.payload {
                Some(Payload::Values { values, revision, .. }) => {
                    let expected =
                        vec![vec![json!("1"), json!("2")], vec![json!("3"), json!("4")]];
                    assert_eq!(values, expected);
                    assert!(revision.starts_with("FORMATTED_VALUE:blake3:"));
                }
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn test_validation_never_reaches_network() {
        let (fake, engine) = engine();
        let op = Operation::new("s", "write_range", json!({"range": "A0"}));
        let result = smol::block_on(engine.execute(op));
        assert_eq!(result.error_code(), Some(ErrorCode::Validation));
        let result = smol::block_on(engine.execute(Operation::new("s", "merge_cells", json!({}))));
        assert_eq!(result.error_code(), Some(ErrorCode::UnsupportedAction));
        assert_eq!(fake.metadata_calls() + fake.batch_calls() + fake.values_calls(), 0);
    }

    #[test]
    fn test_transaction_op_is_queued() {
        let (fake, engine) = engine();
        let txn = engine.begin("s");
        let op = Operation::new("s", "clear_range", json!({"range": "A1"}))
            .in_transaction(txn.clone());
        let result = smol::block_on(engine.execute(op));
        assert_eq!(result.payload, Some(Payload::Queued { transaction_id: txn, position: 0 }));
        assert_eq!(fake.batch_calls(), 0);
    }

    #[test]
    fn test_queued_op_counted_once_at_commit() {
        let (_fake, engine) = engine();
        let txn = engine.begin("s");
        let op = Operation::new("s", "clear_range", json!({"range": "A1"}))
            .in_transaction(txn.clone());
        smol::block_on(engine.execute(op));
        assert!(engine.snapshot().outcomes.is_empty());

        let report = smol::block_on(engine.commit(&txn)).unwrap();
        assert_eq!(report.state, TransactionState::Committed);
        assert_eq!(engine.snapshot().outcomes.get("OK"), Some(&1));
    }

    #[test]
    fn test_dimension_span_past_last_index_is_rejected() {
        let (fake, engine) = engine();
        let params = json!({"dimension": "ROWS", "start": u32::MAX, "count": 2});
        let op = Operation::new("s", "insert_dimension", params);
        let result = smol::block_on(engine.execute(op));
        assert_eq!(result.error_code(), Some(ErrorCode::Validation));
        assert_eq!(fake.batch_calls(), 0);
    }

    #[test]
    fn test_cancel_unknown_is_not_found() {
        let (_fake, engine) = engine();
        assert_eq!(engine.cancel(&"op_nope".into()).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_preflight_reads_whole_sheet_when_reshaped() {
        let book =
            WorkbookModel::new("b").with_sheet(crate::model::SheetModel::new(3, "Data", 100, 10));
        let touches = vec![Touch::Range(GridRange::bounded(3, 0, 1, 0, 1)), Touch::Sheet(3)];
        assert_eq!(preflight_ranges(&touches, &book), vec!["Data".to_string()]);
        let touches = vec![
            Touch::Range(GridRange::bounded(3, 0, 2, 0, 2)),
            Touch::Range(GridRange::bounded(99, 0, 1, 0, 1)),
        ];
        assert_eq!(preflight_ranges(&touches, &book), vec!["Data!A1:B2".to_string()]);
    }

    #[test]
    fn test_snapshot_counts_outcomes() {
        let (_fake, engine) = engine();
        smol::block_on(async {
            let params = json!({"range": "A1", "values": [[1]]});
            engine.execute(Operation::new("s", "write_range", params)).await;
            engine.execute(Operation::new("s", "bogus", json!({}))).await;
        });
        let snap = engine.snapshot();
        assert_eq!(snap.outcomes["OK"], 1);
        assert_eq!(snap.outcomes["UNSUPPORTED_ACTION"], 1);
        assert_eq!(snap.batches.dispatched, 1);
    }
}
