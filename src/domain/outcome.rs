//! Decisions and snapshots produced by rate-limit checks.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of evaluating a single rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleOutcome {
    /// Whether the rule admitted the request
    pub allowed: bool,
    /// Requests still admitted after this one
    pub remaining: u64,
    /// Wait before the rule admits another request (zero when allowed)
    pub retry_after: Duration,
}

impl RuleOutcome {
    /// Admitted with `remaining` left.
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    /// Denied until `retry_after` has passed.
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
        }
    }
}

/// Result of a multi-rule check. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// All rules admitted the request
    pub allowed: bool,
    /// Smallest remaining quota across the evaluated rules
    pub remaining: u64,
    /// Wait dictated by the first failing rule (zero when allowed)
    pub retry_after_secs: f64,
}

impl RateLimitResult {
    /// Result of a check against no rules at all.
    pub fn unrestricted() -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            retry_after_secs: 0.0,
        }
    }

    /// Wait as a duration.
    pub fn retry_after(&self) -> Duration {
        crate::domain::window::saturating_secs(self.retry_after_secs)
    }

    /// Convert a denial into [`Error::RateLimitExceeded`](crate::Error::RateLimitExceeded).
    pub fn into_result(self) -> Result<Self, crate::Error> {
        if self.allowed {
            Ok(self)
        } else {
            Err(crate::Error::RateLimitExceeded {
                retry_after_secs: self.retry_after_secs,
            })
        }
    }
}

/// Non-mutating view of one rule's state for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStatus {
    /// Rule label
    pub label: String,
    /// Requests admitted from a fresh state
    pub limit: u64,
    /// Requests counted in the window, or tokens spent from the bucket
    pub used: u64,
    /// Requests that would still be admitted now
    pub remaining: u64,
    /// Wait before the next request would be admitted (zero if one would be now)
    pub retry_after_secs: f64,
}

/// Which store answered a status read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServedBy {
    /// The remote atomic store
    Remote,
    /// The in-process fallback
    Local,
}

/// Diagnostic snapshot of all rules for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// The checked key
    pub key: String,
    /// Per-rule state, in rule order
    pub rules: Vec<RuleStatus>,
    /// Store that served the read
    pub served_by: ServedBy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_into_result() {
        assert!(RateLimitResult::unrestricted().into_result().is_ok());

        let denied = RateLimitResult {
            allowed: false,
            remaining: 0,
            retry_after_secs: 2.5,
        };
        match denied.into_result() {
            Err(Error::RateLimitExceeded { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 2.5)
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_never_negative() {
        let r = RateLimitResult {
            allowed: false,
            remaining: 0,
            retry_after_secs: -1.0,
        };
        assert_eq!(r.retry_after(), Duration::ZERO);
    }
}
