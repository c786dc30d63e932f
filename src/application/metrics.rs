//! Observability metrics for rate limiting.
//!
//! Counters are process-wide and advisory: they are only reset by a restart
//! or an explicit [`RateLimiterMetrics::reset`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking rate limiting statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Every call to `check`
    total_checks: AtomicU64,
    /// Checks where all rules passed
    allowed: AtomicU64,
    /// Checks denied by some rule
    throttled: AtomicU64,
    /// Rule evaluations served by the in-process fallback
    fallback_checks: AtomicU64,
    /// Remote store calls that failed or timed out
    backend_failures: AtomicU64,
}

impl RateLimiterMetrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_check(&self) {
        self.inner.total_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttled(&self) {
        self.inner.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.inner.fallback_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_failure(&self) {
        self.inner.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the total number of checks.
    pub fn total_checks(&self) -> u64 {
        self.inner.total_checks.load(Ordering::Relaxed)
    }

    /// Get the number of allowed checks.
    pub fn allowed(&self) -> u64 {
        self.inner.allowed.load(Ordering::Relaxed)
    }

    /// Get the number of throttled checks.
    pub fn throttled(&self) -> u64 {
        self.inner.throttled.load(Ordering::Relaxed)
    }

    /// Get the number of rule evaluations served by the fallback.
    pub fn fallback_checks(&self) -> u64 {
        self.inner.fallback_checks.load(Ordering::Relaxed)
    }

    /// Get the number of failed remote store calls.
    pub fn backend_failures(&self) -> u64 {
        self.inner.backend_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_checks: self.total_checks(),
            allowed: self.allowed(),
            throttled: self.throttled(),
            fallback_checks: self.fallback_checks(),
            backend_failures: self.backend_failures(),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.inner.total_checks.store(0, Ordering::Relaxed);
        self.inner.allowed.store(0, Ordering::Relaxed);
        self.inner.throttled.store(0, Ordering::Relaxed);
        self.inner.fallback_checks.store(0, Ordering::Relaxed);
        self.inner.backend_failures.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Every call to `check`
    pub total_checks: u64,
    /// Checks where all rules passed
    pub allowed: u64,
    /// Checks denied by some rule
    pub throttled: u64,
    /// Rule evaluations served by the in-process fallback
    pub fallback_checks: u64,
    /// Remote store calls that failed or timed out
    pub backend_failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of checks that were throttled (0.0 to 1.0).
    ///
    /// Returns 0.0 if no checks have been made.
    pub fn throttle_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.throttled as f64 / self.total_checks as f64
        }
    }
}
