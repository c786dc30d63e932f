//! Transactional retry wrapper.
//!
//! [`TransactionRunner`] runs a unit of work inside a store transaction at a
//! chosen isolation level. Failures whose underlying store error the
//! classifier calls retryable are rolled back and retried with backoff; any
//! other failure is rolled back and returned on first occurrence. When the
//! attempt budget runs out, the last retryable error itself is returned.
//!
//! ## Nesting
//!
//! While work runs, its transaction is recorded in a task-local. A `run` on
//! the same runner from inside that work joins the enclosing transaction: it
//! does not begin, commit or retry, and its errors flow to the outer attempt,
//! which decides. Work spawned onto another task does not inherit the
//! transaction.

use crate::application::backoff::BackoffPolicy;
use crate::application::ports::{ErrorClassifier, StoreTransaction, TransactionalStore};
use crate::domain::transaction::{ErrorClass, IsolationLevel, TransactionContext, TxPhase};
use crate::domain::versioned::{Fields, Record};
use crate::error::{StoreError, TransactionFailure};
use crate::infrastructure::classifier::SqlStateClassifier;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

tokio::task_local! {
    static ENCLOSING: Enclosing;
}

/// The transaction of the work currently running on this task.
struct Enclosing {
    store_id: usize,
    handle: Arc<dyn Any + Send + Sync>,
}

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Name used in logs
    pub operation_name: String,
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            operation_name: "transaction".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RunOptions {
    /// Default options under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            operation_name: name.into(),
            ..Self::default()
        }
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl From<&str> for RunOptions {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

/// Shared access to an open transaction, handed to work.
///
/// Once the attempt finishes, the transaction is taken back by the runner and
/// every further call on a leaked handle fails.
pub struct TxHandle<T> {
    tx: Arc<Mutex<Option<T>>>,
    context: Arc<TransactionContext>,
}

impl<T> Clone for TxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            context: Arc::clone(&self.context),
        }
    }
}

impl<T> fmt::Debug for TxHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<T: StoreTransaction> TxHandle<T> {
    fn new(tx: T, context: TransactionContext) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            context: Arc::new(context),
        }
    }

    /// Parameters of the attempt this handle belongs to.
    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    /// Read a row.
    pub async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let mut guard = self.tx.lock().await;
        open(&mut guard)?.fetch(table, id).await
    }

    /// Insert a row.
    pub async fn insert(&self, table: &str, record: Record) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        open(&mut guard)?.insert(table, record).await
    }

    /// Version-checked update. Returns the affected-row count.
    pub async fn conditional_update(
        &self,
        table: &str,
        id: &str,
        patch: &Fields,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut guard = self.tx.lock().await;
        open(&mut guard)?
            .conditional_update(table, id, patch, expected_version)
            .await
    }

    async fn take(&self) -> Option<T> {
        self.tx.lock().await.take()
    }
}

fn open<T>(slot: &mut Option<T>) -> Result<&mut T, StoreError> {
    slot.as_mut()
        .ok_or_else(|| StoreError::new("transaction already finished"))
}

/// Runs work in transactions with classification-driven retry.
pub struct TransactionRunner<S: TransactionalStore> {
    store: Arc<S>,
    classifier: Arc<dyn ErrorClassifier>,
    backoff: BackoffPolicy,
}

impl<S: TransactionalStore> Clone for TransactionRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            classifier: Arc::clone(&self.classifier),
            backoff: self.backoff,
        }
    }
}

impl<S: TransactionalStore> fmt::Debug for TransactionRunner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("store", &self.store)
            .field("classifier", &self.classifier)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<S: TransactionalStore> TransactionRunner<S> {
    /// Runner over `store` with SQLSTATE classification and default backoff.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            classifier: Arc::new(SqlStateClassifier::new()),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Replace the error classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `work` at `READ COMMITTED` with default options.
    pub async fn run<R, E, F, Fut>(&self, work: F) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError> + TransactionFailure,
    {
        self.execute(IsolationLevel::ReadCommitted, false, RunOptions::default(), work)
            .await
    }

    /// Run `work` at `isolation_level` with `options`.
    pub async fn run_with<R, E, F, Fut>(
        &self,
        isolation_level: IsolationLevel,
        options: impl Into<RunOptions>,
        work: F,
    ) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError> + TransactionFailure,
    {
        self.execute(isolation_level, false, options.into(), work)
            .await
    }

    /// Run `work` at `SERIALIZABLE`.
    pub async fn serializable<R, E, F, Fut>(
        &self,
        options: impl Into<RunOptions>,
        work: F,
    ) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError> + TransactionFailure,
    {
        self.execute(IsolationLevel::Serializable, false, options.into(), work)
            .await
    }

    /// Run `work` at `REPEATABLE READ`.
    pub async fn repeatable_read<R, E, F, Fut>(
        &self,
        options: impl Into<RunOptions>,
        work: F,
    ) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError> + TransactionFailure,
    {
        self.execute(IsolationLevel::RepeatableRead, false, options.into(), work)
            .await
    }

    /// Run `work` at `SERIALIZABLE`, asking the store to lock the rows it
    /// reads for update.
    pub async fn with_pessimistic_lock<R, E, F, Fut>(
        &self,
        options: impl Into<RunOptions>,
        work: F,
    ) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError> + TransactionFailure,
    {
        self.execute(IsolationLevel::Serializable, true, options.into(), work)
            .await
    }

    async fn execute<R, E, F, Fut>(
        &self,
        isolation_level: IsolationLevel,
        lock_rows: bool,
        options: RunOptions,
        mut work: F,
    ) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError> + TransactionFailure,
    {
        if let Some(enclosing) = self.enclosing() {
            tracing::debug!(
                operation = %options.operation_name,
                enclosing = %enclosing.context().operation_name,
                "joining enclosing transaction"
            );
            return work(enclosing).await;
        }

        let max_attempts = options.max_attempts.max(1);
        let mut phase = TxPhase::Started;
        let mut attempt = 1;

        loop {
            let context = TransactionContext {
                isolation_level,
                operation_name: options.operation_name.clone(),
                attempt,
                max_attempts,
                lock_rows,
            };
            phase = transition(phase, TxPhase::Running, &context);

            let err = match self.attempt(&context, &mut work).await {
                Ok(value) => {
                    transition(phase, TxPhase::Committed, &context);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err
                .store_error()
                .map_or(ErrorClass::Fatal, |e| self.classifier.classify(e));

            if class == ErrorClass::Retryable && context.has_attempts_left() {
                phase = transition(phase, TxPhase::RolledBackRetry, &context);
                let delay = self.backoff.delay(attempt);
                tracing::debug!(
                    operation = %context.operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retryable transaction conflict, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
                continue;
            }

            transition(phase, TxPhase::RolledBackFatal, &context);
            if class == ErrorClass::Retryable {
                tracing::error!(
                    operation = %context.operation_name,
                    attempts = attempt,
                    "transaction retries exhausted"
                );
            } else {
                tracing::debug!(
                    operation = %context.operation_name,
                    attempt,
                    "transaction failed, not retrying"
                );
            }
            return Err(err);
        }
    }

    /// One begin / work / commit-or-rollback cycle.
    async fn attempt<R, E, F, Fut>(&self, context: &TransactionContext, work: &mut F) -> Result<R, E>
    where
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError>,
    {
        let tx = self.store.begin(context).await?;
        let handle = TxHandle::new(tx, context.clone());
        let enclosing = Enclosing {
            store_id: self.store_id(),
            handle: Arc::new(handle.clone()),
        };

        let result = ENCLOSING.scope(enclosing, work(handle.clone())).await;
        let tx = handle.take().await;

        match (result, tx) {
            (Ok(value), Some(tx)) => {
                tx.commit().await?;
                Ok(value)
            }
            (Ok(_), None) => Err(StoreError::new("transaction already finished").into()),
            (Err(err), tx) => {
                if let Some(tx) = tx {
                    if let Err(e) = tx.rollback().await {
                        tracing::warn!(
                            error = %e,
                            operation = %context.operation_name,
                            "rollback failed"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    fn store_id(&self) -> usize {
        Arc::as_ptr(&self.store) as *const () as usize
    }

    fn enclosing(&self) -> Option<TxHandle<S::Tx>> {
        let store_id = self.store_id();
        ENCLOSING
            .try_with(|enclosing| {
                (enclosing.store_id == store_id).then(|| Arc::clone(&enclosing.handle))
            })
            .ok()
            .flatten()
            .and_then(|handle| handle.downcast::<TxHandle<S::Tx>>().ok())
            .map(|handle| TxHandle::clone(&handle))
    }
}

fn transition(from: TxPhase, to: TxPhase, context: &TransactionContext) -> TxPhase {
    match from.advance(to) {
        Some(next) => {
            tracing::trace!(
                operation = %context.operation_name,
                attempt = context.attempt,
                phase = ?next,
                "transaction phase"
            );
            next
        }
        None => {
            tracing::error!(?from, ?to, "invalid transaction phase transition");
            to
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::infrastructure::memory_db::MemoryDatabase;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner() -> (TransactionRunner<MemoryDatabase>, MemoryDatabase) {
        let db = MemoryDatabase::new();
        let runner =
            TransactionRunner::new(Arc::new(db.clone())).with_backoff(BackoffPolicy::none());
        (runner, db)
    }

    fn row(id: &str, n: i64) -> Record {
        Record::new(id, json!({ "n": n }).as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let (runner, db) = runner();
        let value = runner
            .run(|tx| async move {
                tx.insert("t", row("1", 1)).await?;
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(db.row_count("t"), 1);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_without_leaking_writes() {
        let (runner, db) = runner();
        let attempts = AtomicU32::new(0);

        let value = runner
            .serializable("book", |tx| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tx.insert("t", row(&format!("attempt-{n}"), n.into())).await?;
                    if n < 3 {
                        return Err(Error::Store(StoreError::serialization_failure()));
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(db.row_count("t"), 1);
        assert!(db.get("t", "attempt-3").is_some());
        assert_eq!(db.rollbacks(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let (runner, db) = runner();
        let attempts = AtomicU32::new(0);

        let err = runner
            .run(|_tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::rejected("room closed")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_cause() {
        let (runner, _) = runner();
        let attempts = AtomicU32::new(0);

        let err = runner
            .run_with(
                IsolationLevel::RepeatableRead,
                RunOptions::named("refund").with_max_attempts(4),
                |_tx| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Error::Store(StoreError::deadlock())) }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match err {
            Error::Store(e) => assert_eq!(e, StoreError::deadlock()),
            other => panic!("expected the deadlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_context_passed_to_work() {
        let (runner, _) = runner();
        let seen = runner
            .with_pessimistic_lock("lock", |tx| async move {
                Ok::<_, Error>(tx.context().clone())
            })
            .await
            .unwrap();

        assert_eq!(seen.isolation_level, IsolationLevel::Serializable);
        assert!(seen.lock_rows);
        assert_eq!(seen.operation_name, "lock");
        assert_eq!(seen.attempt, 1);
        assert_eq!(seen.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_nested_run_joins_outer() {
        let (runner, db) = runner();
        let inner_runner = runner.clone();

        let err = runner
            .run(|tx| {
                let inner_runner = inner_runner.clone();
                async move {
                    tx.insert("t", row("outer", 1)).await?;
                    inner_runner
                        .run(|inner| async move {
                            assert_eq!(inner.context().operation_name, "transaction");
                            inner.insert("t", row("inner", 2)).await?;
                            Ok::<_, Error>(())
                        })
                        .await?;
                    Err::<(), _>(Error::rejected("abort"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(db.row_count("t"), 0);
        assert_eq!(db.commits(), 0);
    }

    #[tokio::test]
    async fn test_nested_commit_happens_once() {
        let (runner, db) = runner();
        let inner_runner = runner.clone();

        runner
            .run(|tx| {
                let inner_runner = inner_runner.clone();
                async move {
                    tx.insert("t", row("outer", 1)).await?;
                    inner_runner
                        .serializable("inner", |inner| async move {
                            inner.insert("t", row("inner", 2)).await?;
                            Ok::<_, Error>(())
                        })
                        .await
                }
            })
            .await
            .unwrap();

        assert_eq!(db.row_count("t"), 2);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn test_commit_conflict_is_retried() {
        let (runner, db) = runner();
        db.seed("t", row("1", 0));
        let attempts = AtomicU32::new(0);
        let patch = json!({ "n": 1 }).as_object().cloned().unwrap_or_default();

        runner
            .serializable("bump", |tx| {
                let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
                let db = db.clone();
                let patch = patch.clone();
                async move {
                    let current = tx.fetch("t", "1").await?.map(|r| r.effective_version());
                    tx.conditional_update("t", "1", &patch, current).await?;
                    if first {
                        // A concurrent writer commits between our update and commit.
                        let mut sneaky = row("1", 99);
                        sneaky.version = Some(2);
                        db.seed("t", sneaky);
                    }
                    Ok::<_, Error>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(db.get("t", "1").unwrap().version, Some(3));
    }
}
