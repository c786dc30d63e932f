//! Per-key rate-limit state machines.
//!
//! Both algorithms are pure: they take an explicit `now` and mutate only their
//! own state. Stores are responsible for running them atomically per key.

use crate::domain::outcome::{RuleOutcome, RuleStatus};
use crate::domain::rule::{SlidingWindow, TokenBucket};
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Tolerance for float drift in token arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Float seconds as a duration, saturating at `Duration::MAX`.
///
/// Negative and NaN inputs map to zero. A tiny refill rate can push a wait
/// past what `Duration` represents.
pub fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Time from `since` to `now`, zero if the clock stepped backwards.
pub fn elapsed(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or(Duration::ZERO)
}

/// Ordered request timestamps within a trailing window.
///
/// # Example
/// ```
/// use booking_guard::domain::rule::SlidingWindow;
/// use booking_guard::domain::window::SlidingWindowState;
/// use std::time::{Duration, SystemTime};
///
/// let limit = SlidingWindow { max: 2, window_secs: 60 };
/// let mut state = SlidingWindowState::new();
/// let now = SystemTime::now();
///
/// assert!(state.hit(&limit, now).allowed);
/// assert!(state.hit(&limit, now).allowed);
/// assert!(!state.hit(&limit, now).allowed);
///
/// // Entries leave the window once it has fully elapsed
/// assert!(state.hit(&limit, now + Duration::from_secs(60)).allowed);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlidingWindowState {
    entries: VecDeque<SystemTime>,
}

impl SlidingWindowState {
    /// Empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored timestamps (any order).
    pub fn from_entries(entries: impl IntoIterator<Item = SystemTime>) -> Self {
        let mut entries: Vec<SystemTime> = entries.into_iter().collect();
        entries.sort();
        Self {
            entries: entries.into(),
        }
    }

    /// Drop entries at or before `now - window`.
    fn expire_old_entries(&mut self, window: Duration, now: SystemTime) {
        while let Some(&oldest) = self.entries.front() {
            if elapsed(oldest, now) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn live_entries(&self, window: Duration, now: SystemTime) -> impl Iterator<Item = &SystemTime> {
        self.entries
            .iter()
            .filter(move |&&ts| elapsed(ts, now) < window)
    }

    fn retry_after(oldest: Option<SystemTime>, window: Duration, now: SystemTime) -> Duration {
        oldest
            .map(|ts| window.saturating_sub(elapsed(ts, now)))
            .unwrap_or(Duration::ZERO)
    }

    /// Prune, then admit and record `now` if fewer than `max` entries remain.
    pub fn hit(&mut self, limit: &SlidingWindow, now: SystemTime) -> RuleOutcome {
        let window = limit.window();
        self.expire_old_entries(window, now);

        let count = self.entries.len() as u64;
        if count < limit.max {
            // Keep the set ordered even if callers read the clock slightly out of order.
            let at = self.entries.partition_point(|&ts| ts <= now);
            self.entries.insert(at, now);
            RuleOutcome::allowed(limit.max - count - 1)
        } else {
            let oldest = self.entries.front().copied();
            RuleOutcome::denied(Self::retry_after(oldest, window, now))
        }
    }

    /// Current counts without mutating anything.
    pub fn status(&self, limit: &SlidingWindow, label: String, now: SystemTime) -> RuleStatus {
        let window = limit.window();
        let mut live = self.live_entries(window, now);
        let oldest = live.next().copied();
        let used = oldest.map_or(0, |_| 1 + live.count() as u64);
        let remaining = limit.max.saturating_sub(used);
        let retry_after = if remaining > 0 {
            Duration::ZERO
        } else {
            Self::retry_after(oldest, window, now)
        };

        RuleStatus {
            label,
            limit: limit.max,
            used,
            remaining,
            retry_after_secs: retry_after.as_secs_f64(),
        }
    }

    /// Most recent entry, used to compute expiry.
    pub fn newest(&self) -> Option<SystemTime> {
        self.entries.back().copied()
    }

    /// Number of stored entries (including not yet pruned ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Token count and the time it was last brought up to date.
///
/// # Example
/// ```
/// use booking_guard::domain::rule::TokenBucket;
/// use booking_guard::domain::window::TokenBucketState;
/// use std::time::{Duration, SystemTime};
///
/// let limit = TokenBucket { capacity: 2, refill_rate_per_sec: 1.0 };
/// let now = SystemTime::now();
/// let mut state = TokenBucketState::full(&limit, now);
///
/// assert!(state.take(&limit, now).allowed);
/// assert!(state.take(&limit, now).allowed);
/// assert!(!state.take(&limit, now).allowed);
/// assert!(state.take(&limit, now + Duration::from_secs(1)).allowed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    tokens: f64,
    last_refill: SystemTime,
}

impl TokenBucketState {
    /// Bucket at full capacity.
    pub fn full(limit: &TokenBucket, now: SystemTime) -> Self {
        Self {
            tokens: limit.capacity as f64,
            last_refill: now,
        }
    }

    /// Rebuild from stored values.
    pub fn from_parts(tokens: f64, last_refill: SystemTime) -> Self {
        Self {
            tokens,
            last_refill,
        }
    }

    /// Tokens after crediting the refill since `last_refill`, capped at capacity.
    fn refilled(&self, limit: &TokenBucket, now: SystemTime) -> f64 {
        let credit = elapsed(self.last_refill, now).as_secs_f64() * limit.refill_rate_per_sec;
        (self.tokens + credit).min(limit.capacity as f64)
    }

    fn wait_for_one(tokens: f64, limit: &TokenBucket) -> Duration {
        saturating_secs((1.0 - tokens) / limit.refill_rate_per_sec)
    }

    /// Refill, then spend one token if available.
    ///
    /// A denial leaves the state untouched; the refill is recomputed from the
    /// stored timestamp next time.
    pub fn take(&mut self, limit: &TokenBucket, now: SystemTime) -> RuleOutcome {
        let tokens = self.refilled(limit, now);
        if tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (tokens - 1.0).max(0.0);
            self.last_refill = self.last_refill.max(now);
            RuleOutcome::allowed((self.tokens + TOKEN_EPSILON).floor() as u64)
        } else {
            RuleOutcome::denied(Self::wait_for_one(tokens, limit))
        }
    }

    /// Current counts without mutating anything.
    pub fn status(&self, limit: &TokenBucket, label: String, now: SystemTime) -> RuleStatus {
        let tokens = self.refilled(limit, now);
        let remaining = (tokens + TOKEN_EPSILON).floor() as u64;
        let retry_after = if remaining > 0 {
            Duration::ZERO
        } else {
            Self::wait_for_one(tokens, limit)
        };

        RuleStatus {
            label,
            limit: limit.capacity,
            used: limit.capacity.saturating_sub(remaining),
            remaining,
            retry_after_secs: retry_after.as_secs_f64(),
        }
    }

    /// Tokens as last stored (without refill).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// When the stored token count was computed.
    pub fn last_refill(&self) -> SystemTime {
        self.last_refill
    }
}
