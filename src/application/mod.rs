//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Rate limiter with remote store, in-process fallback and health tracking
//! - Idempotency guard (replay of completed operations)
//! - Transaction runner (classification-driven retry, nesting)
//! - Versioned entity store (optimistic locking)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod backoff;
pub mod circuit_breaker;
pub mod entity_store;
pub mod idempotency;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod transaction;
