//! Rate-limit rules.
//!
//! A rule is immutable and supplied by the caller on every check. Rules are a
//! tagged variant so algorithm dispatch is exhaustive.

use crate::domain::window::saturating_secs;
use crate::error::RuleError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// At most `max` requests within any trailing `window_secs` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindow {
    /// Maximum requests admitted per window
    pub max: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl SlidingWindow {
    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn validate(&self) -> Result<(), RuleError> {
        if self.max == 0 {
            return Err(RuleError::ZeroMax);
        }
        if self.window_secs == 0 {
            return Err(RuleError::ZeroWindow);
        }
        Ok(())
    }
}

/// Bursts up to `capacity`, refilling continuously at `refill_rate_per_sec`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Maximum tokens held
    pub capacity: u64,
    /// Tokens added per second
    pub refill_rate_per_sec: f64,
}

impl TokenBucket {
    /// Time for an empty bucket to refill completely.
    ///
    /// Also the natural lifetime of an idle bucket: after this long it is full
    /// again and indistinguishable from a fresh one.
    pub fn full_refill(&self) -> Duration {
        saturating_secs((self.capacity as f64 / self.refill_rate_per_sec).ceil())
    }

    fn validate(&self) -> Result<(), RuleError> {
        if self.capacity == 0 {
            return Err(RuleError::ZeroCapacity);
        }
        if !self.refill_rate_per_sec.is_finite() || self.refill_rate_per_sec <= 0.0 {
            return Err(RuleError::InvalidRefillRate);
        }
        Ok(())
    }
}

/// Algorithm and parameters of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Algorithm {
    /// Trailing-window counting
    SlidingWindow(SlidingWindow),
    /// Continuous refill with burst capacity
    TokenBucket(TokenBucket),
}

/// A rate-limit rule with an optional label for multi-rule composition.
///
/// # Example
/// ```
/// use booking_guard::RateLimitRule;
///
/// let per_minute = RateLimitRule::sliding_window(3, 60).unwrap().with_id("per-minute");
/// let burst = RateLimitRule::token_bucket(10, 0.5).unwrap();
///
/// assert_eq!(per_minute.label(), "per-minute");
/// assert_eq!(burst.label(), "tb:10:0.5");
/// assert!(RateLimitRule::sliding_window(0, 60).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Optional label; rules without one are keyed by their parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Algorithm and parameters
    #[serde(flatten)]
    pub algorithm: Algorithm,
}

impl RateLimitRule {
    /// Sliding-window rule admitting `max` requests per `window_secs`.
    pub fn sliding_window(max: u64, window_secs: u64) -> Result<Self, RuleError> {
        let limit = SlidingWindow { max, window_secs };
        limit.validate()?;
        Ok(Self {
            id: None,
            algorithm: Algorithm::SlidingWindow(limit),
        })
    }

    /// Token-bucket rule with burst `capacity` and `refill_rate_per_sec`.
    pub fn token_bucket(capacity: u64, refill_rate_per_sec: f64) -> Result<Self, RuleError> {
        let limit = TokenBucket {
            capacity,
            refill_rate_per_sec,
        };
        limit.validate()?;
        Ok(Self {
            id: None,
            algorithm: Algorithm::TokenBucket(limit),
        })
    }

    /// Attach a label.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Re-check parameters of a rule built by hand or deserialized.
    pub fn validate(&self) -> Result<(), RuleError> {
        match &self.algorithm {
            Algorithm::SlidingWindow(limit) => limit.validate(),
            Algorithm::TokenBucket(limit) => limit.validate(),
        }
    }

    /// Label used to namespace this rule's state under a key.
    pub fn label(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match &self.algorithm {
            Algorithm::SlidingWindow(l) => format!("sw:{}:{}", l.max, l.window_secs),
            Algorithm::TokenBucket(l) => format!("tb:{}:{}", l.capacity, l.refill_rate_per_sec),
        }
    }

    /// Requests admitted without delay from a fresh state.
    pub fn limit(&self) -> u64 {
        match &self.algorithm {
            Algorithm::SlidingWindow(l) => l.max,
            Algorithm::TokenBucket(l) => l.capacity,
        }
    }

    /// How long idle state for this rule stays meaningful.
    pub fn ttl(&self) -> Duration {
        match &self.algorithm {
            Algorithm::SlidingWindow(l) => l.window(),
            Algorithm::TokenBucket(l) => l.full_refill(),
        }
    }
}
