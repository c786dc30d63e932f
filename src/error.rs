//! Error taxonomy.
//!
//! Correctness-critical failures (`VersionConflict`, exhausted store conflicts)
//! always reach the caller. Best-effort failures of the rate limiter's remote
//! store are absorbed by the fallback and never appear here.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the guards in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A rate-limit rule has invalid parameters.
    #[error(transparent)]
    InvalidRule(#[from] RuleError),
    /// The caller exceeded a rate-limit rule.
    #[error("too many requests, retry after {retry_after_secs:.2} seconds")]
    RateLimitExceeded {
        /// Seconds until the failing rule admits another request
        retry_after_secs: f64,
    },

    /// The entity changed since the caller read it.
    #[error("resource changed (expected version {expected}, found {actual}), reload and retry")]
    VersionConflict {
        /// Version supplied by the caller
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// No entity with this id exists.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind (table name)
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// Caller-supplied changes tried to set the server-managed version.
    #[error("version is server-managed and cannot be part of the changes")]
    VersionNotWritable,

    /// Caller-supplied changes could not be turned into a field patch.
    #[error("invalid changes: {0}")]
    InvalidChanges(String),

    /// Another caller is executing the same idempotency key right now.
    #[error("operation for idempotency key {key} is already in progress")]
    InProgress {
        /// The contended idempotency key
        key: String,
    },

    /// A business rule rejected the operation. Never retried.
    #[error("{0}")]
    Rejected(String),

    /// The relational store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The remote atomic store failed where no fallback applies.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A stored result could not be encoded or decoded.
    #[error("failed to encode or decode stored value: {0}")]
    Codec(String),
}

impl Error {
    /// Shorthand for a business-rule rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// SQLSTATE for a serialization failure.
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for a detected deadlock.
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Failure reported by the relational transactional store.
///
/// Carries the SQLSTATE or vendor error code when the driver exposes one, so
/// an [`ErrorClassifier`](crate::application::ports::ErrorClassifier) can decide
/// whether the failure is a transient conflict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    code: Option<String>,
    message: String,
}

impl StoreError {
    /// Error without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Error with a SQLSTATE or vendor code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Serialization failure (`40001`).
    pub fn serialization_failure() -> Self {
        Self::with_code(
            SERIALIZATION_FAILURE,
            "could not serialize access due to concurrent update",
        )
    }

    /// Deadlock (`40P01`).
    pub fn deadlock() -> Self {
        Self::with_code(DEADLOCK_DETECTED, "deadlock detected")
    }

    /// Unique violation (`23505`).
    pub fn unique_violation(what: impl std::fmt::Display) -> Self {
        Self::with_code(UNIQUE_VIOLATION, format!("duplicate key: {what}"))
    }

    /// The SQLSTATE or vendor code, if known.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// The driver message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure of the remote atomic key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The store could not be reached or refused the command.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured timeout.
    #[error("backing store timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with something we cannot interpret.
    #[error("unexpected backing store response: {0}")]
    Protocol(String),
}

/// Invalid rate-limit rule parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuleError {
    /// Sliding window `max` must be at least 1
    #[error("sliding window max must be greater than 0")]
    ZeroMax,
    /// Sliding window length must be non-zero
    #[error("sliding window length must be greater than 0")]
    ZeroWindow,
    /// Token bucket capacity must be at least 1
    #[error("token bucket capacity must be greater than 0")]
    ZeroCapacity,
    /// Refill rate must be a positive, finite number
    #[error("token bucket refill rate must be positive and finite")]
    InvalidRefillRate,
}

/// Invalid builder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Maximum tracked keys must be greater than zero
    #[error("max_tracked_keys must be greater than 0")]
    ZeroMaxTrackedKeys,
    /// Remote timeout must be greater than zero
    #[error("remote_timeout must be greater than 0")]
    ZeroRemoteTimeout,
    /// Failure threshold must be greater than zero
    #[error("failure_threshold must be greater than 0")]
    ZeroFailureThreshold,
}

/// Access to the store-level cause of a transaction failure.
///
/// The transaction runner only ever retries failures whose store error is
/// classified as retryable; anything without a store error is fatal.
pub trait TransactionFailure {
    /// The underlying relational store error, if this failure came from the store.
    fn store_error(&self) -> Option<&StoreError>;
}

impl TransactionFailure for Error {
    fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl TransactionFailure for StoreError {
    fn store_error(&self) -> Option<&StoreError> {
        Some(self)
    }
}
