//! # booking-guard
//!
//! Concurrency-safety primitives for the mutating request paths of a booking
//! backend: rate limiting, idempotent execution, transactional retry and
//! optimistic version locking.
//!
//! The crate is an in-process library. It talks to two external systems through
//! ports (traits) that the host application implements or picks an adapter for:
//! a remote atomic key-value store (Redis adapter behind the `redis-storage`
//! feature) and a relational transactional store.
//!
//! ## Quick Start
//!
//! ```rust
//! use booking_guard::{
//!     IdempotencyGuard, MemoryDatabase, MemoryIdempotencyStore, Mutation, MutationGuard,
//!     RateLimitRule, RateLimiter, Record, TransactionRunner,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::builder().build()?;
//! let rules = vec![
//!     RateLimitRule::sliding_window(10, 60)?,
//!     RateLimitRule::token_bucket(5, 0.5)?,
//! ];
//! let runner = TransactionRunner::new(Arc::new(MemoryDatabase::new()));
//! let guard = MutationGuard::new(limiter, rules, runner)
//!     .with_idempotency(IdempotencyGuard::new(Arc::new(MemoryIdempotencyStore::new())));
//!
//! let booking = guard
//!     .execute(
//!         Mutation::new("user-42", "create booking").idempotent("booking:user-42:req-1"),
//!         |tx| async move {
//!             tx.insert("bookings", Record::new("b-1", Default::default())).await?;
//!             Ok("b-1".to_string())
//!         },
//!     )
//!     .await?;
//! assert!(booking.was_executed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! ### Rate Limiting
//! - **Sliding window**: at most `max` requests in any trailing window
//! - **Token bucket**: bursts up to `capacity`, continuous refill
//! - **Multiple rules**: all must pass; evaluated in order, first denial wins
//! - **Fallback**: remote store failures or timeouts switch the limiter to a
//!   bounded in-process store; degradation is sticky unless re-probing is
//!   configured
//!
//! ### Idempotency
//! - Completed results are stored (TTL) and replayed instead of re-running
//! - Failed operations store nothing and run again next time
//! - `execute_exclusive` excludes concurrent first calls with a pending marker
//!
//! ### Transactions
//! - Isolation levels `READ COMMITTED` (default), `REPEATABLE READ`, `SERIALIZABLE`
//! - Retry on serialization failures and deadlocks with exponential backoff and jitter
//! - Everything else is rolled back and returned on first occurrence
//! - Nested runs join the enclosing transaction
//!
//! ### Optimistic Locking
//! - `update(id, changes, expected_version)` is a single conditional write
//! - Stale versions fail with [`Error::VersionConflict`] and change nothing
//!
//! ## Failure Policy
//!
//! Correctness-critical failures (version conflicts, exhausted retries) always
//! reach the caller. Rate limiting is best effort: remote store failures are
//! logged and absorbed by the fallback.
//!
//! ```rust
//! # use booking_guard::{HealthState, RateLimitRule, RateLimiter};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::builder().build()?;
//! match limiter.health() {
//!     HealthState::Healthy => println!("remote store in use"),
//!     HealthState::Degraded => println!("serving from memory"),
//!     HealthState::Probing => println!("testing recovery"),
//! }
//!
//! let rules = [RateLimitRule::sliding_window(3, 60)?];
//! limiter.check("user-42", &rules).await?;
//! let snapshot = limiter.metrics().snapshot();
//! println!("throttle rate: {:.2}%", snapshot.throttle_rate() * 100.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! All diagnostics go through `tracing`. The crate never installs a
//! subscriber.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod error;

pub use error::{BackendError, BuildError, Error, RuleError, StoreError, TransactionFailure};

// Re-export commonly used types for convenience
pub use domain::{
    idempotency::{generate_key, IdempotencyRecord, IdempotencyStatus},
    outcome::{RateLimitResult, RateLimitStatus, RuleOutcome, RuleStatus, ServedBy},
    room::{Room, RoomChanges, RoomStatus},
    rule::{Algorithm, RateLimitRule, SlidingWindow, TokenBucket},
    transaction::{ErrorClass, IsolationLevel, TransactionContext, TxPhase},
    versioned::{Fields, Record, Versioned, VersionedEntity},
};

pub use application::{
    backoff::BackoffPolicy,
    circuit_breaker::{BackendHealth, HealthConfig, HealthState},
    entity_store::VersionedEntityStore,
    idempotency::{Execution, IdempotencyConfig, IdempotencyGuard},
    limiter::{RateLimiter, RateLimiterBuilder, RateLimiterConfig},
    metrics::{MetricsSnapshot, RateLimiterMetrics},
    pipeline::{Mutation, MutationGuard},
    ports::{
        Clock, ErrorClassifier, EvictionCandidate, EvictionPolicy, IdempotencyStore,
        RateLimitStore, StoreTransaction, TransactionalStore,
    },
    transaction::{RunOptions, TransactionRunner, TxHandle},
};

pub use infrastructure::{
    classifier::SqlStateClassifier,
    clock::SystemClock,
    eviction::LruEviction,
    memory_db::{MemoryDatabase, MemoryTransaction},
    memory_idempotency::MemoryIdempotencyStore,
    memory_store::MemoryRateLimitStore,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_store::{RedisStore, RedisStoreConfig};
