//! Transaction vocabulary: isolation levels, per-call context and the phase
//! state machine driven by the transaction runner.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Each statement sees data committed before it started
    #[default]
    ReadCommitted,
    /// The transaction sees a stable snapshot
    RepeatableRead,
    /// Equivalent to some serial execution order
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, e.g. for `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient conflict: roll back and try again
    Retryable,
    /// Anything else: roll back and propagate
    Fatal,
}

/// Per-call transaction parameters, handed to the store on `begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    /// Requested isolation level
    pub isolation_level: IsolationLevel,
    /// Name used in logs
    pub operation_name: String,
    /// Current attempt, starting at 1
    pub attempt: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Rows read for update should be locked (`SELECT ... FOR UPDATE`)
    pub lock_rows: bool,
}

impl TransactionContext {
    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Phase of one runner call.
///
/// ```text
/// Started -> Running -> Committed
///                    -> RolledBackRetry -> Running
///                    -> RolledBackFatal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Call accepted, no attempt yet
    Started,
    /// An attempt is executing
    Running,
    /// Work committed (terminal)
    Committed,
    /// Retryable failure rolled back; another attempt follows
    RolledBackRetry,
    /// Failure rolled back and propagated (terminal)
    RolledBackFatal,
}

impl TxPhase {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxPhase::Committed | TxPhase::RolledBackFatal)
    }

    /// Move to `next`, or return `None` if the transition is not allowed.
    pub fn advance(self, next: TxPhase) -> Option<TxPhase> {
        use TxPhase::*;
        match (self, next) {
            (Started, Running)
            | (Running, Committed)
            | (Running, RolledBackRetry)
            | (Running, RolledBackFatal)
            | (RolledBackRetry, Running) => Some(next),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let phase = TxPhase::Started
            .advance(TxPhase::Running)
            .and_then(|p| p.advance(TxPhase::Committed));
        assert_eq!(phase, Some(TxPhase::Committed));
        assert!(TxPhase::Committed.is_terminal());
    }

    #[test]
    fn test_retry_loop() {
        let phase = TxPhase::Running
            .advance(TxPhase::RolledBackRetry)
            .and_then(|p| p.advance(TxPhase::Running))
            .and_then(|p| p.advance(TxPhase::RolledBackFatal));
        assert_eq!(phase, Some(TxPhase::RolledBackFatal));
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(TxPhase::Started.advance(TxPhase::Committed), None);
        assert_eq!(TxPhase::Committed.advance(TxPhase::Running), None);
        assert_eq!(TxPhase::RolledBackFatal.advance(TxPhase::Running), None);
        assert_eq!(TxPhase::RolledBackRetry.advance(TxPhase::Committed), None);
    }

    #[test]
    fn test_attempts_left() {
        let mut ctx = TransactionContext {
            isolation_level: IsolationLevel::default(),
            operation_name: "op".into(),
            attempt: 1,
            max_attempts: 2,
            lock_rows: false,
        };
        assert!(ctx.has_attempts_left());
        ctx.attempt = 2;
        assert!(!ctx.has_attempts_left());
    }

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::Serializable.to_string(), "SERIALIZABLE");
    }
}
