//! Guarded mutations: rate limit, then idempotency, then a transaction.

use crate::application::idempotency::{Execution, IdempotencyGuard};
use crate::application::limiter::RateLimiter;
use crate::application::ports::TransactionalStore;
use crate::application::transaction::{RunOptions, TransactionRunner, TxHandle};
use crate::domain::rule::RateLimitRule;
use crate::domain::transaction::IsolationLevel;
use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;

/// One mutation to run through a [`MutationGuard`].
#[derive(Debug, Clone)]
pub struct Mutation<'a> {
    /// Key the rate-limit rules are counted under (user, IP, ...)
    pub rate_key: &'a str,
    /// Deduplication key; `None` runs the work unconditionally
    pub idempotency_key: Option<&'a str>,
    /// Isolation level for the transaction
    pub isolation_level: IsolationLevel,
    /// Run options for the transaction
    pub options: RunOptions,
}

impl<'a> Mutation<'a> {
    /// Mutation named `operation`, counted under `rate_key`, at
    /// `READ COMMITTED` and without an idempotency key.
    pub fn new(rate_key: &'a str, operation: impl Into<String>) -> Self {
        Self {
            rate_key,
            idempotency_key: None,
            isolation_level: IsolationLevel::ReadCommitted,
            options: RunOptions::named(operation),
        }
    }

    /// Deduplicate under `key`.
    pub fn idempotent(mut self, key: &'a str) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Run at `level`.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }
}

/// Request-path composition of the four primitives.
///
/// Every mutation is first checked against the rate-limit rules and refused
/// with [`Error::RateLimitExceeded`] when throttled. If it carries an
/// idempotency key and a guard is configured, a completed result is replayed;
/// otherwise the work runs in a retried transaction.
pub struct MutationGuard<S: TransactionalStore> {
    limiter: RateLimiter,
    rules: Vec<RateLimitRule>,
    idempotency: Option<IdempotencyGuard>,
    runner: TransactionRunner<S>,
}

impl<S: TransactionalStore> fmt::Debug for MutationGuard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationGuard")
            .field("rules", &self.rules)
            .field("idempotency", &self.idempotency.is_some())
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl<S: TransactionalStore> MutationGuard<S> {
    /// Guard checking `rules` before running work through `runner`.
    pub fn new(limiter: RateLimiter, rules: Vec<RateLimitRule>, runner: TransactionRunner<S>) -> Self {
        Self {
            limiter,
            rules,
            idempotency: None,
            runner,
        }
    }

    /// Deduplicate mutations that carry an idempotency key.
    pub fn with_idempotency(mut self, guard: IdempotencyGuard) -> Self {
        self.idempotency = Some(guard);
        self
    }

    /// The rate limiter in front of every mutation.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run `work` for `mutation`.
    ///
    /// A replayed result counts against the rate limit like a fresh one.
    ///
    /// # Errors
    /// `Error::RateLimitExceeded` when throttled, otherwise whatever the
    /// idempotency lookup or the transaction returns.
    pub async fn execute<T, F, Fut>(&self, mutation: Mutation<'_>, work: F) -> Result<Execution<T>, Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(TxHandle<S::Tx>) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.limiter.enforce(mutation.rate_key, &self.rules).await?;

        let Mutation {
            idempotency_key,
            isolation_level,
            options,
            ..
        } = mutation;
        let transaction = self.runner.run_with(isolation_level, options, work);

        match (&self.idempotency, idempotency_key) {
            (Some(guard), Some(key)) => guard.execute(key, || transaction).await,
            _ => Ok(Execution {
                was_executed: true,
                result: transaction.await?,
            }),
        }
    }
}
