//! Idempotency records and key composition.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    /// An exclusive execution holds the key; no result yet
    Pending,
    /// The operation succeeded and its result is stored
    Completed,
}

/// Stored outcome of an idempotent operation.
///
/// Absence of a `Completed` record means the operation has not durably
/// succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Idempotency key
    pub key: String,
    /// Current status
    pub status: IdempotencyStatus,
    /// Encoded operation result (empty while pending)
    pub result: Vec<u8>,
    /// When the record was written
    pub stored_at: SystemTime,
}

impl IdempotencyRecord {
    /// Marker for an execution in progress.
    pub fn pending(key: impl Into<String>, now: SystemTime) -> Self {
        Self {
            key: key.into(),
            status: IdempotencyStatus::Pending,
            result: Vec::new(),
            stored_at: now,
        }
    }

    /// Record of a successful execution.
    pub fn completed(key: impl Into<String>, result: Vec<u8>, now: SystemTime) -> Self {
        Self {
            key: key.into(),
            status: IdempotencyStatus::Completed,
            result,
            stored_at: now,
        }
    }

    /// Whether the operation durably succeeded.
    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }
}

/// Join identifying components into an idempotency key, preserving order.
///
/// # Example
/// ```
/// use booking_guard::generate_key;
///
/// assert_eq!(generate_key(&["refund", "123", "pi_abc"]), "refund:123:pi_abc");
/// assert_ne!(generate_key(&["a", "b"]), generate_key(&["b", "a"]));
/// ```
pub fn generate_key<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_deterministic() {
        let a = generate_key(&["booking", "42", "job-7"]);
        let b = generate_key(&["booking", "42", "job-7"]);
        assert_eq!(a, b);
        assert_eq!(a, "booking:42:job-7");
    }

    #[test]
    fn test_generate_key_owned_parts() {
        let id = 42.to_string();
        assert_eq!(generate_key(&["room".to_string(), id]), "room:42");
        assert_eq!(generate_key::<&str>(&[]), "");
    }

    #[test]
    fn test_record_status() {
        let now = SystemTime::now();
        assert!(!IdempotencyRecord::pending("k", now).is_completed());
        assert!(IdempotencyRecord::completed("k", vec![1], now).is_completed());
    }
}
