//! Read cache.
//!
//! Short-TTL store for idempotent reads, keyed by spreadsheet, resource and
//! diff mode. Bounded by entry count and approximate bytes; expired entries
//! go first, then least-recently-used ones. A successful write invalidates
//! every entry of its spreadsheet.
//!
//! Design decisions:
//! - Concurrent identical reads share one fetch (per-key flight lock)
//! - Each spreadsheet carries a generation bumped on invalidation; a fetch
//!   that started before a write never stores its (stale) result
//! - Failures are not cached

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gridrelay_config::CacheConfig;
use gridrelay_core::{Payload, Result, SpreadsheetId};
use gridrelay_protocol::ValueRenderOption;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Fidelity of a cached read. Distinct modes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Formatted,
    Unformatted,
    Formula,
    /// Sheet properties only
    Metadata,
    /// Metadata plus grid data
    Full,
}

impl From<ValueRenderOption> for DiffMode {
    fn from(render: ValueRenderOption) -> Self {
        match render {
            ValueRenderOption::FormattedValue => DiffMode::Formatted,
            ValueRenderOption::UnformattedValue => DiffMode::Unformatted,
            ValueRenderOption::Formula => DiffMode::Formula,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub spreadsheet_id: SpreadsheetId,
    /// Canonical A1 range, or the metadata query.
    pub resource: String,
    pub mode: DiffMode,
}

impl CacheKey {
    pub fn new(
        spreadsheet_id: &SpreadsheetId,
        resource: impl Into<String>,
        mode: DiffMode,
    ) -> Self {
        Self { spreadsheet_id: spreadsheet_id.clone(), resource: resource.into(), mode }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct Entry {
    payload: Payload,
    expires_at: Instant,
    bytes: usize,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    bytes: usize,
    hits: u64,
    misses: u64,
    generations: HashMap<SpreadsheetId, u64>,
}

impl Inner {
    fn generation(&self, spreadsheet_id: &SpreadsheetId) -> u64 {
        self.generations.get(spreadsheet_id).copied().unwrap_or(0)
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.pop(key) {
            self.bytes -= entry.bytes;
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
    }
}

pub struct ReadCache {
    inner: Mutex<Inner>,
    flights: Mutex<HashMap<CacheKey, Arc<smol::lock::Mutex<()>>>>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl ReadCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
                generations: HashMap::new(),
            }),
            flights: Mutex::new(HashMap::new()),
            ttl: Duration::from_millis(config.ttl_ms),
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            clock,
        }
    }

    /// Fresh entry, counted as a hit or miss.
    pub fn get(&self, key: &CacheKey) -> Option<Payload> {
        let found = self.lookup(key);
        self.record(found.is_some());
        found
    }

    /// Store with the configured TTL.
    pub fn insert(&self, key: CacheKey, payload: Payload) {
        let generation = self.inner.lock().generation(&key.spreadsheet_id);
        self.store(key, payload, generation);
    }

    /// Drop every entry of one spreadsheet.
    pub fn invalidate(&self, spreadsheet_id: &SpreadsheetId) {
        let mut inner = self.inner.lock();
        *inner.generations.entry(spreadsheet_id.clone()).or_insert(0) += 1;
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| &k.spreadsheet_id == spreadsheet_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        if !doomed.is_empty() {
            log::debug!("cache: invalidated {} entries for {}", doomed.len(), spreadsheet_id);
        }
    }

    /// Serve from cache, or run `fetch` once for all concurrent callers of
    /// the same key and store a successful result.
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<Payload>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload>>,
    {
        if let Some(payload) = self.lookup(&key) {
            self.record(true);
            log::debug!("cache hit: {} {:?}", key.resource, key.mode);
            return Ok(payload);
        }

        let flight = self
            .flights
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(smol::lock::Mutex::new(())))
            .clone();
        let result = {
            let _guard = flight.lock().await;
            // A concurrent caller may have filled the entry while we waited.
            if let Some(payload) = self.lookup(&key) {
                self.record(true);
                Ok(payload)
            } else {
                self.record(false);
                log::debug!("cache miss: {} {:?}", key.resource, key.mode);
                let generation = self.inner.lock().generation(&key.spreadsheet_id);
                let fetched = fetch().await;
                if let Ok(payload) = &fetched {
                    self.store(key.clone(), payload.clone(), generation);
                }
                fetched
            }
        };

        let mut flights = self.flights.lock();
        // Map plus our handle: nobody else is waiting.
        if Arc::strong_count(&flight) <= 2 {
            flights.remove(&key);
        }
        result
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let mut inner = self.inner.lock();
        inner.purge_expired(self.clock.now());
        let total = inner.hits + inner.misses;
        CacheSnapshot {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 { 0.0 } else { inner.hits as f64 / total as f64 },
        }
    }

    // ── Internal helpers ────────────────────────────────────────────────

    fn lookup(&self, key: &CacheKey) -> Option<Payload> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.payload.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove(key);
        }
        None
    }

    fn record(&self, hit: bool) {
        let mut inner = self.inner.lock();
        if hit {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
    }

    fn store(&self, key: CacheKey, payload: Payload, generation: u64) {
        if self.max_entries == 0 {
            return;
        }
        let bytes = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0) + key.resource.len();
        if bytes > self.max_bytes {
            log::debug!("cache: {} is {} bytes, not cached", key.resource, bytes);
            return;
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.generation(&key.spreadsheet_id) != generation {
            log::debug!("cache: dropping {} fetched before a write", key.resource);
            return;
        }

        inner.remove(&key);
        inner.purge_expired(now);
        while inner.entries.len() >= self.max_entries || inner.bytes + bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.bytes -= evicted.bytes,
                None => break,
            }
        }
        inner.bytes += bytes;
        inner.entries.put(key, Entry { payload, expires_at: now + self.ttl, bytes });
    }
}
