//! In-process relational store.
//!
//! Each transaction buffers its writes and remembers the version of every row
//! it touched. Commit validates, under the database lock, that none of those
//! rows changed since; the first committer wins and later ones fail with a
//! serialization failure (`40001`), which is what a real database reports for
//! the same interleaving at `REPEATABLE READ` or above.
//!
//! Row locks requested through [`TransactionContext::lock_rows`] are not taken;
//! commit-time validation gives the same linearization for version updates.

use crate::application::ports::{StoreTransaction, TransactionalStore};
use crate::domain::transaction::{IsolationLevel, TransactionContext};
use crate::domain::versioned::{Fields, Record};
use crate::error::StoreError;
use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type RowKey = (String, String);

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<AHashMap<String, AHashMap<String, Record>>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Shared {
    fn committed(&self, table: &str, id: &str) -> Option<Record> {
        self.tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }
}

/// In-process [`TransactionalStore`].
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row directly, outside any transaction.
    pub fn seed(&self, table: &str, record: Record) {
        self.shared
            .tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Committed state of a row.
    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.shared.committed(table, id)
    }

    /// Number of committed rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .tables
            .lock()
            .get(table)
            .map_or(0, |rows| rows.len())
    }

    /// Transactions committed so far.
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::Relaxed)
    }

    /// Transactions rolled back so far.
    pub fn rollbacks(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransactionalStore for MemoryDatabase {
    type Tx = MemoryTransaction;

    async fn begin(&self, context: &TransactionContext) -> Result<Self::Tx, StoreError> {
        tracing::trace!(
            operation = %context.operation_name,
            isolation = %context.isolation_level,
            attempt = context.attempt,
            "begin"
        );
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            isolation_level: context.isolation_level,
            base_versions: AHashMap::new(),
            writes: AHashMap::new(),
        })
    }
}

/// A transaction on a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    isolation_level: IsolationLevel,
    /// Version of each touched row when first seen; `None` if it did not exist
    base_versions: AHashMap<RowKey, Option<u64>>,
    writes: AHashMap<RowKey, Record>,
}

impl MemoryTransaction {
    /// Isolation level requested at `begin`.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn read(&mut self, table: &str, id: &str) -> Option<Record> {
        let key = (table.to_string(), id.to_string());
        if let Some(record) = self.writes.get(&key) {
            return Some(record.clone());
        }
        let record = self.shared.committed(table, id);
        self.base_versions
            .entry(key)
            .or_insert_with(|| record.as_ref().map(Record::effective_version));
        record
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn fetch(&mut self, table: &str, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.read(table, id))
    }

    async fn insert(&mut self, table: &str, record: Record) -> Result<(), StoreError> {
        if self.read(table, &record.id).is_some() {
            return Err(StoreError::unique_violation(format!(
                "{table}.id = {}",
                record.id
            )));
        }
        self.writes
            .insert((table.to_string(), record.id.clone()), record);
        Ok(())
    }

    async fn conditional_update(
        &mut self,
        table: &str,
        id: &str,
        patch: &Fields,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let Some(mut record) = self.read(table, id) else {
            return Ok(0);
        };
        if let Some(expected) = expected_version {
            if record.effective_version() != expected {
                return Ok(0);
            }
        }
        record.apply(patch);
        self.writes
            .insert((table.to_string(), id.to_string()), record);
        Ok(1)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut tables = self.shared.tables.lock();

        for key in self.writes.keys() {
            let current = tables
                .get(&key.0)
                .and_then(|rows| rows.get(&key.1))
                .map(Record::effective_version);
            let base = self.base_versions.get(key).copied().flatten();
            if current != base {
                drop(tables);
                self.shared.rollbacks.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::serialization_failure());
            }
        }

        for ((table, id), record) in self.writes {
            tables.entry(table).or_default().insert(id, record);
        }
        drop(tables);
        self.shared.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.shared.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
