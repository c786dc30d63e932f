//! SQLSTATE and message based error classification.

use crate::application::ports::ErrorClassifier;
use crate::domain::transaction::ErrorClass;
use crate::error::{StoreError, DEADLOCK_DETECTED, SERIALIZATION_FAILURE};

/// Codes that mark a transient conflict.
const RETRYABLE_CODES: &[&str] = &[
    SERIALIZATION_FAILURE,
    DEADLOCK_DETECTED,
    // MySQL: deadlock found when trying to get lock
    "1213",
    // MySQL: lock wait timeout exceeded
    "1205",
];

/// Lower-cased message fragments that mark a transient conflict when the
/// driver exposes no code.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "deadlock",
    "could not serialize",
    "serialization failure",
    "lock wait timeout",
    "database is locked",
    "try restarting transaction",
];

/// Classifies conflicts, deadlocks and lock timeouts as retryable; everything
/// else is fatal.
///
/// # Example
/// ```
/// use booking_guard::application::ports::ErrorClassifier;
/// use booking_guard::domain::transaction::ErrorClass;
/// use booking_guard::error::StoreError;
/// use booking_guard::infrastructure::classifier::SqlStateClassifier;
///
/// let classifier = SqlStateClassifier::new();
/// assert_eq!(classifier.classify(&StoreError::deadlock()), ErrorClass::Retryable);
/// assert_eq!(classifier.classify(&StoreError::new("syntax error")), ErrorClass::Fatal);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStateClassifier;

impl SqlStateClassifier {
    /// Create the classifier.
    pub fn new() -> Self {
        Self
    }
}

impl ErrorClassifier for SqlStateClassifier {
    fn classify(&self, error: &StoreError) -> ErrorClass {
        if let Some(code) = error.code() {
            if RETRYABLE_CODES.contains(&code) {
                return ErrorClass::Retryable;
            }
        }

        let message = error.message().to_lowercase();
        if RETRYABLE_FRAGMENTS
            .iter()
            .any(|fragment| message.contains(fragment))
        {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}
