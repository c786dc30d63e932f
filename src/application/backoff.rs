//! Retry delays for the transaction runner.

use crate::domain::window::saturating_secs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with proportional jitter.
///
/// The delay after failed attempt `n` (1-based) is
/// `min(base_delay * 2^(n-1), max_delay)`, plus a random extra of up to
/// `jitter` times that amount so colliding callers spread out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Cap on the exponential part
    pub max_delay: Duration,
    /// Random extra as a fraction of the delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately. Useful in tests.
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Deterministic part of the delay after failed attempt `attempt`.
    pub fn base_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Delay to wait after failed attempt `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let extra = base.as_secs_f64() * jitter * rand::thread_rng().gen::<f64>();
        base.saturating_add(saturating_secs(extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(4), Duration::from_millis(50));
        assert_eq!(policy.delay(100), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 1..6 {
            let base = policy.base_for(attempt);
            let delay = policy.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(0.25));
        }
    }

    #[test]
    fn test_none() {
        assert_eq!(BackoffPolicy::none().delay(3), Duration::ZERO);
    }
}
