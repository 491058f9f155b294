//! Transaction registry.
//!
//! Lifecycle: OPEN → COMMITTING → {COMMITTED | ABORTED}, OPEN → ROLLED_BACK,
//! and OPEN → ABORTED when idle past the TTL. Transactions refer to
//! operations and history only by id.
//!
//! Design decisions:
//! - Each transaction sits behind its own lock; every state change is a
//!   check-and-set under it, so concurrent commit/rollback on one id cannot
//!   both proceed
//! - The lock is never held across remote calls: COMMITTING is the claim
//! - Expiry is swept lazily on every registry access, no timer thread
//! - Terminal transactions stay queryable for `retention_ms`, then vanish
//!   (TRANSACTION_NOT_FOUND)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gridrelay_config::TransactionConfig;
use gridrelay_core::{
    CoreError, ErrorCode, NormalizedOp, OperationId, Result, SpreadsheetId, TransactionId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RolledBack,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Aborted
        )
    }
}

struct Transaction {
    id: TransactionId,
    spreadsheet_id: SpreadsheetId,
    state: TransactionState,
    ops: Vec<NormalizedOp>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    closed_at: Option<Instant>,
    error: Option<CoreError>,
}

impl Transaction {
    /// Error for any request that needs the transaction OPEN.
    fn not_open(&self) -> CoreError {
        match &self.error {
            Some(e) if e.code == ErrorCode::TransactionExpired => e.clone(),
            _ => CoreError::new(
                ErrorCode::TransactionClosed,
                format!("Transaction {} is {:?}", self.id, self.state),
            ),
        }
    }

    fn close(&mut self, state: TransactionState, error: Option<CoreError>, now: Instant) {
        self.state = state;
        self.error = error;
        self.closed_at = Some(now);
        self.ops.clear();
    }
}

/// Read-only view for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    pub id: TransactionId,
    pub spreadsheet_id: SpreadsheetId,
    pub state: TransactionState,
    pub queued: Vec<OperationId>,
    pub created_at: DateTime<Utc>,
    pub idle_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
}

pub struct TransactionManager {
    registry: Mutex<HashMap<TransactionId, Arc<Mutex<Transaction>>>>,
    idle_ttl: Duration,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl TransactionManager {
    pub fn new(config: &TransactionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            idle_ttl: Duration::from_millis(config.idle_ttl_ms),
            retention: Duration::from_millis(config.retention_ms),
            clock,
        }
    }

    pub fn begin(&self, spreadsheet_id: &SpreadsheetId) -> TransactionId {
        self.sweep();
        let id = TransactionId::new();
        let txn = Transaction {
            id: id.clone(),
            spreadsheet_id: spreadsheet_id.clone(),
            state: TransactionState::Open,
            ops: Vec::new(),
            created_at: Utc::now(),
            last_activity: self.clock.now(),
            closed_at: None,
            error: None,
        };
        self.registry.lock().insert(id.clone(), Arc::new(Mutex::new(txn)));
        log::info!("transaction {} opened on {}", id, spreadsheet_id);
        id
    }

    /// Append a mutating operation. Returns its zero-based position.
    pub fn queue(&self, id: &TransactionId, op: NormalizedOp) -> Result<usize> {
        let txn = self.lookup(id)?;
        let mut txn = txn.lock();
        if txn.state != TransactionState::Open {
            return Err(txn.not_open());
        }
        if !op.action.is_mutating() {
            return Err(CoreError::validation(format!(
                "{} is a read; only mutating operations can be queued",
                op.action.label()
            )));
        }
        if op.spreadsheet_id != txn.spreadsheet_id {
            return Err(CoreError::validation(format!(
                "Transaction {} is scoped to {}, not {}",
                id, txn.spreadsheet_id, op.spreadsheet_id
            )));
        }
        txn.ops.push(op);
        txn.last_activity = self.clock.now();
        Ok(txn.ops.len() - 1)
    }

    /// Claim the transaction for commit: OPEN → COMMITTING. Returns the
    /// spreadsheet and the queued operations in order.
    pub fn start_commit(&self, id: &TransactionId) -> Result<(SpreadsheetId, Vec<NormalizedOp>)> {
        let txn = self.lookup(id)?;
        let mut txn = txn.lock();
        if txn.state != TransactionState::Open {
            return Err(txn.not_open());
        }
        txn.state = TransactionState::Committing;
        txn.last_activity = self.clock.now();
        log::info!("transaction {} committing {} operations", id, txn.ops.len());
        Ok((txn.spreadsheet_id.clone(), txn.ops.clone()))
    }

    /// COMMITTING → COMMITTED, or ABORTED with the error that failed it.
    pub fn finish(&self, id: &TransactionId, error: Option<CoreError>) {
        let Ok(txn) = self.lookup(id) else {
            return;
        };
        let mut txn = txn.lock();
        if txn.state != TransactionState::Committing {
            return;
        }
        let now = self.clock.now();
        match error {
            None => {
                log::info!("transaction {} committed", id);
                txn.close(TransactionState::Committed, None, now);
            }
            Some(e) => {
                log::info!("transaction {} aborted: {}", id, e);
                txn.close(TransactionState::Aborted, Some(e), now);
            }
        }
    }

    /// Ties a claimed commit to a guard. Dropping the guard before
    /// [`CommitGuard::finish`] aborts the transaction, so a commit future
    /// dropped mid-flight never leaves it COMMITTING.
    pub fn guard_commit(&self, id: &TransactionId) -> CommitGuard<'_> {
        CommitGuard { manager: self, id: Some(id.clone()) }
    }

    /// OPEN → ROLLED_BACK; nothing has been dispatched.
    pub fn rollback(&self, id: &TransactionId) -> Result<()> {
        let txn = self.lookup(id)?;
        let mut txn = txn.lock();
        if txn.state != TransactionState::Open {
            return Err(txn.not_open());
        }
        log::info!("transaction {} rolled back ({} operations discarded)", id, txn.ops.len());
        txn.close(TransactionState::RolledBack, None, self.clock.now());
        Ok(())
    }

    pub fn status(&self, id: &TransactionId) -> Result<TransactionStatus> {
        let txn = self.lookup(id)?;
        let txn = txn.lock();
        Ok(TransactionStatus {
            id: txn.id.clone(),
            spreadsheet_id: txn.spreadsheet_id.clone(),
            state: txn.state,
            queued: txn.ops.iter().map(|op| op.id.clone()).collect(),
            created_at: txn.created_at,
            idle_ms: self.clock.now().saturating_duration_since(txn.last_activity).as_millis()
                as u64,
            error: txn.error.clone(),
        })
    }

    /// Remove a queued operation from whichever open transaction holds it.
    pub fn cancel_op(&self, op_id: &OperationId) -> Option<TransactionId> {
        self.sweep();
        let registry = self.registry.lock();
        for (id, txn) in registry.iter() {
            let mut txn = txn.lock();
            if txn.state != TransactionState::Open {
                continue;
            }
            if let Some(pos) = txn.ops.iter().position(|op| &op.id == op_id) {
                txn.ops.remove(pos);
                txn.last_activity = self.clock.now();
                log::debug!("cancelled {} queued in {}", op_id, id);
                return Some(id.clone());
            }
        }
        None
    }

    // ── Internal helpers ────────────────────────────────────────────────

    fn lookup(&self, id: &TransactionId) -> Result<Arc<Mutex<Transaction>>> {
        self.sweep();
        self.registry
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| {
                CoreError::new(ErrorCode::TransactionNotFound, format!("No transaction {}", id))
            })
    }

    fn sweep(&self) {
        let now = self.clock.now();
        let ttl_ms = self.idle_ttl.as_millis();
        let mut registry = self.registry.lock();
        registry.retain(|id, txn| {
            let mut txn = txn.lock();
            let idle = now.saturating_duration_since(txn.last_activity);
            if txn.state == TransactionState::Open && idle >= self.idle_ttl {
                log::warn!("transaction {} idle past {}ms; aborting", id, ttl_ms);
                let expired = CoreError::new(
                    ErrorCode::TransactionExpired,
                    format!("Transaction {} expired after {}ms idle", id, ttl_ms),
                );
                txn.close(TransactionState::Aborted, Some(expired), now);
            }
            match txn.closed_at {
                Some(closed) => now.saturating_duration_since(closed) < self.retention,
                None => true,
            }
        });
    }
}

pub struct CommitGuard<'a> {
    manager: &'a TransactionManager,
    id: Option<TransactionId>,
}

impl CommitGuard<'_> {
    pub fn finish(mut self, error: Option<CoreError>) {
        if let Some(id) = self.id.take() {
            self.manager.finish(&id, error);
        }
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            log::warn!("transaction {} commit abandoned before completion", id);
            let abandoned = CoreError::new(
                ErrorCode::Cancelled,
                format!("Commit of {} was abandoned; remote state may be partially applied", id),
            );
            self.manager.finish(&id, Some(abandoned));
        }
    }
}
