//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports, and tests
//! substitute in-memory fakes for them.

use crate::domain::idempotency::IdempotencyRecord;
use crate::domain::outcome::{RuleOutcome, RuleStatus};
use crate::domain::rule::{RateLimitRule, SlidingWindow, TokenBucket};
use crate::domain::transaction::{ErrorClass, TransactionContext};
use crate::domain::versioned::{Fields, Record};
use crate::error::{BackendError, StoreError};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

/// Port for obtaining current time.
///
/// Wall-clock time is used because rate-limit state is shared with other
/// processes through the remote store. Infrastructure provides `SystemClock`;
/// tests use `MockClock`.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now(&self) -> SystemTime;
}

/// Candidate entry for eviction consideration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate<K> {
    /// The key of the entry
    pub key: K,
    /// Last time the entry was touched
    pub last_access: SystemTime,
}

/// Port for eviction decisions in bounded in-process stores.
pub trait EvictionPolicy<K>: Send + Sync + Debug
where
    K: Clone,
{
    /// Select a victim from the given candidates.
    ///
    /// # Returns
    /// The key of the entry to evict, or None if no eviction should occur
    fn select_victim(&self, candidates: &[EvictionCandidate<K>]) -> Option<K>;

    /// Check if eviction should be triggered before inserting a new entry.
    fn should_evict(&self, current_entries: usize) -> bool;
}

/// Port for the atomic rate-limit store.
///
/// Each mutating operation must run read-modify-write for a single key as one
/// indivisible step: a server-side script for remote stores, a per-key lock
/// for in-process ones. Keys arrive fully namespaced.
#[async_trait]
pub trait RateLimitStore: Send + Sync + Debug {
    /// Prune entries older than the window, then record `now` if under `max`.
    async fn hit_sliding_window(
        &self,
        key: &str,
        limit: &SlidingWindow,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError>;

    /// Refill the bucket up to `now`, then spend one token if available.
    async fn take_token(
        &self,
        key: &str,
        limit: &TokenBucket,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError>;

    /// Read the current state of one rule without mutating it.
    async fn status(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: SystemTime,
    ) -> Result<RuleStatus, BackendError>;

    /// Remove every key starting with `prefix`. Returns how many were removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<usize, BackendError>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), BackendError>;
}

/// Port for idempotency records with expiry.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + Debug {
    /// Fetch a live record.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BackendError>;

    /// Store a record, replacing any existing one.
    async fn put(&self, record: IdempotencyRecord, ttl: Duration) -> Result<(), BackendError>;

    /// Store a record only if no live record exists. Returns whether it was stored.
    async fn put_if_absent(
        &self,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Delete a record if present.
    async fn remove(&self, key: &str) -> Result<(), BackendError>;
}

/// One open transaction on the relational store.
#[async_trait]
pub trait StoreTransaction: Send + 'static {
    /// Read a row (seeing this transaction's own writes).
    async fn fetch(&mut self, table: &str, id: &str) -> Result<Option<Record>, StoreError>;

    /// Insert a new row. Fails with a unique violation if it exists.
    async fn insert(&mut self, table: &str, record: Record) -> Result<(), StoreError>;

    /// `UPDATE table SET patch, version = COALESCE(version, 1) + 1 WHERE id = ?
    /// [AND COALESCE(version, 1) = expected]`.
    ///
    /// Check and increment are one statement. Returns the affected-row count.
    async fn conditional_update(
        &mut self,
        table: &str,
        id: &str,
        patch: &Fields,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Make the writes durable.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard the writes.
    async fn rollback(self) -> Result<(), StoreError>;
}

/// Port for the relational transactional store.
#[async_trait]
pub trait TransactionalStore: Send + Sync + Debug + 'static {
    /// Transaction type produced by `begin`
    type Tx: StoreTransaction;

    /// Begin a transaction with the context's isolation level.
    async fn begin(&self, context: &TransactionContext) -> Result<Self::Tx, StoreError>;
}

/// Collaborator deciding whether a store error is a transient conflict.
pub trait ErrorClassifier: Send + Sync + Debug {
    /// Classify a relational store error.
    fn classify(&self, error: &StoreError) -> ErrorClass;
}
