//! In-process idempotency store.
//!
//! Records expire lazily: a read or conditional write that finds an expired
//! record treats it as absent and removes it. Keys that are never read again
//! are collected by a sweep that runs every `purge_interval` writes.

use crate::application::ports::{Clock, IdempotencyStore};
use crate::domain::idempotency::IdempotencyRecord;
use crate::domain::window::elapsed;
use crate::error::BackendError;
use crate::infrastructure::clock::SystemClock;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Writes between expiry sweeps unless configured otherwise.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: IdempotencyRecord,
    ttl: Duration,
}

impl StoredRecord {
    fn is_expired(&self, now: SystemTime) -> bool {
        elapsed(self.record.stored_at, now) >= self.ttl
    }
}

/// [`IdempotencyStore`] backed by a concurrent map.
#[derive(Debug)]
pub struct MemoryIdempotencyStore {
    records: DashMap<String, StoredRecord, ahash::RandomState>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    purge_interval: u64,
}

impl MemoryIdempotencyStore {
    /// Store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Store using `clock` for expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::with_hasher(ahash::RandomState::new()),
            clock,
            writes: AtomicU64::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    /// Sweep expired records every `writes` writes (minimum 1).
    pub fn with_purge_interval(mut self, writes: u64) -> Self {
        self.purge_interval = writes.max(1);
        self
    }

    /// Number of stored records, including expired ones not yet collected.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    /// Count a write and sweep when the interval comes round.
    ///
    /// Must not be called while holding a guard into `records`.
    fn note_write(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.purge_interval == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::trace!(purged, "swept expired idempotency records");
            }
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BackendError> {
        let now = self.clock.now();
        let live = self
            .records
            .get(key)
            .map(|stored| (!stored.is_expired(now)).then(|| stored.record.clone()));

        match live {
            Some(Some(record)) => Ok(Some(record)),
            Some(None) => {
                self.records
                    .remove_if(key, |_, stored| stored.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: IdempotencyRecord, ttl: Duration) -> Result<(), BackendError> {
        self.records
            .insert(record.key.clone(), StoredRecord { record, ttl });
        self.note_write();
        Ok(())
    }

    async fn put_if_absent(
        &self,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let claimed = match self.records.entry(record.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredRecord { record, ttl });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredRecord { record, ttl });
                true
            }
        };
        if claimed {
            self.note_write();
        }
        Ok(claimed)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.records.remove(key);
        Ok(())
    }
}
