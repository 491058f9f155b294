//! Quota manager: token-bucket admission for remote calls.
//!
//! Two independent buckets, read and write, each refilled lazily from
//! elapsed time on every check. There is no background timer.
//!
//! Design decisions:
//! - Check-and-decrement happens under one lock, so N concurrent callers
//!   can never be granted more than the bucket holds
//! - All-or-nothing: a cost above the available tokens consumes nothing
//! - A cost above capacity can never be granted and fails at once
//! - Blocking policy sleeps until refill (bounded by `max_wait_ms`);
//!   fail-fast policy returns RATE_LIMIT_EXCEEDED with a retry hint

use std::sync::Arc;
use std::time::{Duration, Instant};

use gridrelay_config::{BucketConfig, QuotaConfig, QuotaPolicy};
use gridrelay_core::{CoreError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Read,
    Write,
}

/// Outcome of a non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Not enough tokens; this many milliseconds until there will be.
    Wait { retry_after_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub tokens: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub read: BucketSnapshot,
    pub write: BucketSnapshot,
}

/// One token bucket.
struct TokenBucket {
    /// Current token count (as f64 for fractional refill).
    tokens: f64,
    capacity: u32,
    window_ms: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity as f64,
            capacity: config.capacity,
            window_ms: config.window_ms,
            last_refill: now,
        }
    }

    /// tokens = min(capacity, tokens + elapsed * capacity / window)
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let elapsed_ms = elapsed.as_nanos() as f64 / 1e6;
        let refill = elapsed_ms * self.capacity as f64 / self.window_ms as f64;
        self.tokens = (self.tokens + refill).min(self.capacity as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self, cost: u32, now: Instant) -> Admission {
        self.refill(now);
        if cost == 0 {
            return Admission::Granted;
        }
        if (cost as f64) <= self.tokens {
            self.tokens -= cost as f64;
            Admission::Granted
        } else {
            let needed = cost as f64 - self.tokens;
            let wait_ms = needed * self.window_ms as f64 / self.capacity as f64;
            Admission::Wait { retry_after_ms: wait_ms.ceil().max(1.0) as u64 }
        }
    }

    fn snapshot(&mut self, now: Instant) -> BucketSnapshot {
        self.refill(now);
        BucketSnapshot { tokens: self.tokens.floor() as u32, capacity: self.capacity }
    }
}

/// Process-wide admission control. Constructed explicitly and shared by
/// reference; there is no global instance.
pub struct QuotaManager {
    read: Mutex<TokenBucket>,
    write: Mutex<TokenBucket>,
    policy: QuotaPolicy,
    max_wait: Duration,
    clock: Arc<dyn Clock>,
}

impl QuotaManager {
    pub fn new(config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            read: Mutex::new(TokenBucket::new(config.read, now)),
            write: Mutex::new(TokenBucket::new(config.write, now)),
            policy: config.policy,
            max_wait: Duration::from_millis(config.max_wait_ms),
            clock,
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    fn bucket(&self, kind: BucketKind) -> &Mutex<TokenBucket> {
        match kind {
            BucketKind::Read => &self.read,
            BucketKind::Write => &self.write,
        }
    }

    /// Single atomic check-and-decrement.
    pub fn try_acquire(&self, kind: BucketKind, cost: u32) -> Result<Admission> {
        let mut bucket = self.bucket(kind).lock();
        if cost > bucket.capacity {
            return Err(CoreError {
                message: format!(
                    "Cost {} exceeds the {:?} bucket capacity of {}",
                    cost, kind, bucket.capacity
                ),
                ..CoreError::rate_limited(None)
            });
        }
        Ok(bucket.try_consume(cost, self.clock.now()))
    }

    /// Acquire under the configured policy.
    pub async fn acquire(&self, kind: BucketKind, cost: u32) -> Result<()> {
        let mut waited = Duration::ZERO;
        loop {
            let retry_after_ms = match self.try_acquire(kind, cost)? {
                Admission::Granted => return Ok(()),
                Admission::Wait { retry_after_ms } => retry_after_ms,
            };
            let pause = Duration::from_millis(retry_after_ms);
            if self.policy == QuotaPolicy::FailFast || waited + pause > self.max_wait {
                log::debug!("{:?} quota exhausted; retry after {}ms", kind, retry_after_ms);
                return Err(CoreError::rate_limited(Some(retry_after_ms)));
            }
            log::debug!("{:?} quota exhausted; waiting {}ms", kind, retry_after_ms);
            smol::Timer::after(pause).await;
            waited += pause;
        }
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let now = self.clock.now();
        QuotaSnapshot {
            read: self.read.lock().snapshot(now),
            write: self.write.lock().snapshot(now),
        }
    }
}
