//! Optimistic version locking for entities.
//!
//! Writers pass the version they read. The store turns that into a single
//! conditional update (`... WHERE id = ? AND version = ?`), so checking and
//! incrementing the version cannot race. A stale version surfaces as
//! [`Error::VersionConflict`] and the row is left unchanged.

use crate::application::ports::TransactionalStore;
use crate::application::transaction::{RunOptions, TransactionRunner};
use crate::domain::transaction::IsolationLevel;
use crate::domain::versioned::{
    changes_to_patch, decode_entity, encode_entity, Versioned, VersionedEntity,
};
use crate::error::Error;
use std::fmt;
use std::marker::PhantomData;

/// Reads and writes one kind of [`VersionedEntity`].
///
/// # Example
/// ```
/// use booking_guard::{
///     Error, MemoryDatabase, Room, RoomChanges, RoomStatus, TransactionRunner,
///     VersionedEntityStore,
/// };
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Error> {
/// let runner = TransactionRunner::new(Arc::new(MemoryDatabase::new()));
/// let rooms = VersionedEntityStore::<_, Room>::new(runner);
///
/// rooms
///     .create(&Room {
///         id: "r1".into(),
///         name: "Dorm A".into(),
///         capacity: 8,
///         price_per_night_cents: 2500,
///         status: RoomStatus::Available,
///     })
///     .await?;
///
/// let updated = rooms.update("r1", &RoomChanges::price(2800), Some(1)).await?;
/// assert_eq!(updated.version, 2);
///
/// let stale = rooms.update("r1", &RoomChanges::price(3000), Some(1)).await;
/// assert!(matches!(stale, Err(Error::VersionConflict { expected: 1, actual: 2 })));
/// # Ok(())
/// # }
/// ```
pub struct VersionedEntityStore<S: TransactionalStore, E> {
    runner: TransactionRunner<S>,
    _entity: PhantomData<fn() -> E>,
}

impl<S: TransactionalStore, E> Clone for VersionedEntityStore<S, E> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            _entity: PhantomData,
        }
    }
}

impl<S: TransactionalStore, E> fmt::Debug for VersionedEntityStore<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedEntityStore")
            .field("entity", &std::any::type_name::<E>())
            .field("runner", &self.runner)
            .finish()
    }
}

impl<S: TransactionalStore, E: VersionedEntity> VersionedEntityStore<S, E> {
    /// Store running its statements through `runner`.
    pub fn new(runner: TransactionRunner<S>) -> Self {
        Self {
            runner,
            _entity: PhantomData,
        }
    }

    /// The runner used for every statement.
    pub fn runner(&self) -> &TransactionRunner<S> {
        &self.runner
    }

    /// Read an entity with its current version.
    ///
    /// Rows without a version read as version 1.
    pub async fn read(&self, id: &str) -> Result<Versioned<E>, Error> {
        self.runner
            .run_with(
                IsolationLevel::ReadCommitted,
                RunOptions::named(format!("read {}", E::TABLE)),
                |tx| async move {
                    let record = tx
                        .fetch(E::TABLE, id)
                        .await?
                        .ok_or_else(|| not_found::<E>(id))?;
                    decode_entity(&record)
                },
            )
            .await
    }

    /// Insert a new entity at version 1.
    ///
    /// # Errors
    /// A store error with a unique violation if the id is taken, or
    /// `Error::VersionNotWritable` if the entity serializes a version field.
    pub async fn create(&self, entity: &E) -> Result<Versioned<E>, Error> {
        let record = encode_entity(entity)?;
        let record = &record;
        self.runner
            .run_with(
                IsolationLevel::ReadCommitted,
                RunOptions::named(format!("create {}", E::TABLE)),
                |tx| async move {
                    tx.insert(E::TABLE, record.clone()).await?;
                    decode_entity(record)
                },
            )
            .await
    }

    /// Apply `changes` and bump the version by one.
    ///
    /// With `expected_version` the update only applies if the stored version
    /// still matches; without it the update is unconditional. Either way
    /// the check and the increment are one statement.
    ///
    /// # Errors
    /// - `Error::VersionConflict` if the stored version differs
    /// - `Error::NotFound` if no such row exists
    /// - `Error::VersionNotWritable` if `changes` tries to set the version
    pub async fn update(
        &self,
        id: &str,
        changes: &E::Changes,
        expected_version: Option<u64>,
    ) -> Result<Versioned<E>, Error> {
        let patch = changes_to_patch(changes)?;
        let patch = &patch;
        self.runner
            .with_pessimistic_lock(
                RunOptions::named(format!("update {}", E::TABLE)),
                |tx| async move {
                    let affected = tx
                        .conditional_update(E::TABLE, id, patch, expected_version)
                        .await?;

                    let current = tx.fetch(E::TABLE, id).await?;
                    match (affected, current, expected_version) {
                        (0, Some(current), Some(expected)) => {
                            let actual = current.effective_version();
                            tracing::debug!(
                                entity = E::TABLE,
                                id,
                                expected,
                                actual,
                                "version conflict"
                            );
                            Err(Error::VersionConflict { expected, actual })
                        }
                        (0, _, _) | (_, None, _) => Err(not_found::<E>(id)),
                        (_, Some(current), _) => decode_entity(&current),
                    }
                },
            )
            .await
    }
}

fn not_found<E: VersionedEntity>(id: &str) -> Error {
    Error::NotFound {
        entity: E::TABLE,
        id: id.to_string(),
    }
}
