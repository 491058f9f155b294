//! gridrelay execution engine.
//!
//! Turns normalized operations into remote reads and batchUpdate calls:
//! compile, pack, admit under quota, dispatch, and parse replies back into
//! one result per operation. Also owns transactions, undo history, the read
//! cache and engine metrics. Start at [`Engine`].

pub mod batch;
pub mod cache;
pub mod clock;
pub mod compiler;
pub mod conflict;
pub mod dispatch;
pub mod engine;
pub mod history;
pub mod inverse;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod quota;
pub mod revision;
pub mod transaction;

#[cfg(any(test, feature = "test-harness"))]
pub mod harness;

pub use cache::{CacheSnapshot, DiffMode};
pub use clock::{Clock, ManualClock, RealClock};
pub use engine::{CancelOutcome, CommitReport, Direction, Engine, HistoryMove};
pub use history::{EntrySummary, HistoryView};
pub use metrics::{BatchStats, EngineSnapshot};
pub use quota::QuotaSnapshot;
pub use transaction::{TransactionState, TransactionStatus};
