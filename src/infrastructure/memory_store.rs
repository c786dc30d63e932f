//! In-process rate-limit store.
//!
//! Serves as the fallback when the remote store is unhealthy, and as the only
//! store for single-process deployments and tests. Each key's state lives in a
//! sharded `DashMap`; the map's per-entry lock makes every read-modify-write
//! for one key atomic while other keys proceed in parallel.
//!
//! Memory is bounded by a maximum tracked-key count. When a new key would
//! exceed it, expired state is dropped first and then the least recently
//! touched key is evicted.

use crate::application::ports::{EvictionCandidate, EvictionPolicy, RateLimitStore};
use crate::domain::outcome::{RuleOutcome, RuleStatus};
use crate::domain::rule::{Algorithm, RateLimitRule, SlidingWindow, TokenBucket};
use crate::domain::window::{elapsed, SlidingWindowState, TokenBucketState};
use crate::error::{BackendError, BuildError};
use crate::infrastructure::eviction::LruEviction;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Default maximum number of tracked keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone)]
enum RuleState {
    Window(SlidingWindowState),
    Bucket(TokenBucketState),
}

impl RuleState {
    fn hit_window(&mut self, limit: &SlidingWindow, now: SystemTime) -> RuleOutcome {
        match self {
            RuleState::Window(window) => window.hit(limit, now),
            // The label was reused for a different algorithm; start over.
            RuleState::Bucket(_) => {
                let mut window = SlidingWindowState::new();
                let outcome = window.hit(limit, now);
                *self = RuleState::Window(window);
                outcome
            }
        }
    }

    fn take_token(&mut self, limit: &TokenBucket, now: SystemTime) -> RuleOutcome {
        match self {
            RuleState::Bucket(bucket) => bucket.take(limit, now),
            RuleState::Window(_) => {
                let mut bucket = TokenBucketState::full(limit, now);
                let outcome = bucket.take(limit, now);
                *self = RuleState::Bucket(bucket);
                outcome
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: RuleState,
    last_access: SystemTime,
    ttl: Duration,
}

impl Slot {
    fn new(state: RuleState, now: SystemTime, ttl: Duration) -> Self {
        Self {
            state,
            last_access: now,
            ttl,
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        elapsed(self.last_access, now) >= self.ttl
    }
}

/// Bounded in-process [`RateLimitStore`].
#[derive(Debug)]
pub struct MemoryRateLimitStore {
    slots: DashMap<String, Slot, ahash::RandomState>,
    eviction: Arc<dyn EvictionPolicy<String>>,
    evictions: AtomicU64,
}

impl MemoryRateLimitStore {
    /// Store tracking at most [`DEFAULT_MAX_TRACKED_KEYS`] keys.
    pub fn new() -> Self {
        Self::with_eviction_policy(Arc::new(LruEviction::new(DEFAULT_MAX_TRACKED_KEYS)))
    }

    /// Store tracking at most `max_tracked_keys` keys with LRU eviction.
    ///
    /// # Errors
    /// Returns `BuildError::ZeroMaxTrackedKeys` if `max_tracked_keys` is zero.
    pub fn with_max_tracked_keys(max_tracked_keys: usize) -> Result<Self, BuildError> {
        if max_tracked_keys == 0 {
            return Err(BuildError::ZeroMaxTrackedKeys);
        }
        Ok(Self::with_eviction_policy(Arc::new(LruEviction::new(
            max_tracked_keys,
        ))))
    }

    /// Store with a custom eviction policy.
    pub fn with_eviction_policy(eviction: Arc<dyn EvictionPolicy<String>>) -> Self {
        Self {
            slots: DashMap::with_hasher(ahash::RandomState::new()),
            eviction,
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of keys evicted to respect the bound.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Evict before inserting `key` if the store is full.
    ///
    /// Must not be called while holding a guard into `slots`.
    fn make_room(&self, key: &str, now: SystemTime) {
        if self.slots.contains_key(key) || !self.eviction.should_evict(self.slots.len()) {
            return;
        }

        self.slots.retain(|_, slot| !slot.is_expired(now));
        if !self.eviction.should_evict(self.slots.len()) {
            return;
        }

        let candidates: Vec<EvictionCandidate<String>> = self
            .slots
            .iter()
            .map(|entry| EvictionCandidate {
                key: entry.key().clone(),
                last_access: entry.value().last_access,
            })
            .collect();

        if let Some(victim) = self.eviction.select_victim(&candidates) {
            if self.slots.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %victim, "evicted rate-limit state");
            }
        }
    }

    /// Run `f` on the state for `key` under the key's lock.
    fn with_state<R>(
        &self,
        key: &str,
        now: SystemTime,
        ttl: Duration,
        fresh: impl Fn() -> RuleState,
        f: impl FnOnce(&mut RuleState) -> R,
    ) -> R {
        self.make_room(key, now);

        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(fresh(), now, ttl));
        if slot.is_expired(now) {
            *slot = Slot::new(fresh(), now, ttl);
        }

        let result = f(&mut slot.state);
        slot.last_access = slot.last_access.max(now);
        slot.ttl = ttl;
        result
    }

    /// Synchronous sliding-window hit.
    pub fn hit_window(&self, key: &str, limit: &SlidingWindow, now: SystemTime) -> RuleOutcome {
        self.with_state(
            key,
            now,
            limit.window(),
            || RuleState::Window(SlidingWindowState::new()),
            |state| state.hit_window(limit, now),
        )
    }

    /// Synchronous token-bucket take.
    pub fn take(&self, key: &str, limit: &TokenBucket, now: SystemTime) -> RuleOutcome {
        self.with_state(
            key,
            now,
            limit.full_refill(),
            || RuleState::Bucket(TokenBucketState::full(limit, now)),
            |state| state.take_token(limit, now),
        )
    }

    /// Synchronous, non-mutating status read.
    pub fn rule_status(&self, key: &str, rule: &RateLimitRule, now: SystemTime) -> RuleStatus {
        let label = rule.label();
        let slot = self.slots.get(key).filter(|slot| !slot.is_expired(now));
        let state = slot.as_ref().map(|slot| &slot.state);

        match (&rule.algorithm, state) {
            (Algorithm::SlidingWindow(limit), Some(RuleState::Window(window))) => {
                window.status(limit, label, now)
            }
            (Algorithm::SlidingWindow(limit), _) => {
                SlidingWindowState::new().status(limit, label, now)
            }
            (Algorithm::TokenBucket(limit), Some(RuleState::Bucket(bucket))) => {
                bucket.status(limit, label, now)
            }
            (Algorithm::TokenBucket(limit), _) => {
                TokenBucketState::full(limit, now).status(limit, label, now)
            }
        }
    }

    /// Remove every key starting with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.slots.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        limit: &SlidingWindow,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError> {
        Ok(self.hit_window(key, limit, now))
    }

    async fn take_token(
        &self,
        key: &str,
        limit: &TokenBucket,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError> {
        Ok(self.take(key, limit, now))
    }

    async fn status(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: SystemTime,
    ) -> Result<RuleStatus, BackendError> {
        Ok(self.rule_status(key, rule, now))
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        Ok(self.remove_prefix(prefix))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
