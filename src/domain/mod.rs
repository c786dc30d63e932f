//! Domain layer - pure types and algorithms with no I/O.
//!
//! This layer contains the core concepts and invariants:
//! - Rate-limit rules and the sliding-window / token-bucket state machines
//! - Idempotency records and key composition
//! - Versioned entities and their row representation
//! - Transaction vocabulary (isolation levels, phases, error classes)
//!
//! All types in this layer take time as an explicit argument and are easily testable.

pub mod idempotency;
pub mod outcome;
pub mod room;
pub mod rule;
pub mod transaction;
pub mod versioned;
pub mod window;
