//! Health tracking for the remote rate-limit store.
//!
//! Implements a circuit breaker over the remote store. When it trips, the rate
//! limiter stops calling the remote store and serves every check from the
//! in-process fallback instead of failing requests.
//!
//! ```text
//! Healthy --(failure_threshold consecutive failures)--> Degraded
//! Degraded --(reprobe_after elapsed, next check)--> Probing
//! Probing --(success)--> Healthy
//! Probing --(failure)--> Degraded
//! ```
//!
//! With `reprobe_after: None` the `Degraded` state is sticky for the process
//! lifetime unless [`BackendHealth::record_success`] is called explicitly (for
//! example after a successful health probe).

use crate::application::ports::Clock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Health states of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// Remote store in use
    Healthy = 0,
    /// Remote store bypassed, fallback in use
    Degraded = 1,
    /// One trial call against the remote store is allowed
    Probing = 2,
}

impl From<u8> for HealthState {
    fn from(value: u8) -> Self {
        match value {
            1 => HealthState::Degraded,
            2 => HealthState::Probing,
            _ => HealthState::Healthy,
        }
    }
}

/// Configuration for health tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before the remote store is bypassed
    pub failure_threshold: u32,
    /// Time in `Degraded` before a trial call; `None` keeps it degraded
    pub reprobe_after: Option<Duration>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            reprobe_after: None,
        }
    }
}

/// Circuit breaker guarding the remote store.
#[derive(Debug)]
pub struct BackendHealth {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    /// Nanoseconds since the Unix epoch
    last_failure_nanos: AtomicU64,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
}

impl BackendHealth {
    /// Create a tracker in the `Healthy` state.
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(HealthState::Healthy as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_nanos: AtomicU64::new(0),
            config,
            clock,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the next operation should go to the remote store.
    pub fn allow_remote(&self) -> bool {
        match self.state() {
            HealthState::Healthy => true,
            HealthState::Degraded => {
                let Some(reprobe_after) = self.config.reprobe_after else {
                    return false;
                };
                let since_failure = self
                    .clock
                    .now()
                    .duration_since(self.last_failure_time())
                    .unwrap_or(Duration::ZERO);
                if since_failure < reprobe_after {
                    return false;
                }
                // Only one caller wins the transition and performs the trial call.
                self.state
                    .compare_exchange(
                        HealthState::Degraded as u8,
                        HealthState::Probing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            }
            // A trial is already in flight.
            HealthState::Probing => false,
        }
    }

    /// Record a successful remote operation.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let previous = self
            .state
            .swap(HealthState::Healthy as u8, Ordering::AcqRel);
        if HealthState::from(previous) != HealthState::Healthy {
            tracing::info!("remote rate-limit store recovered, leaving fallback");
        }
    }

    /// Record a failed remote operation.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        let nanos = self
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
            .try_into()
            .unwrap_or(u64::MAX);
        self.last_failure_nanos.store(nanos, Ordering::Release);

        match self.state() {
            HealthState::Probing => {
                self.state
                    .store(HealthState::Degraded as u8, Ordering::Release);
                tracing::warn!("remote rate-limit store probe failed, staying on fallback");
            }
            HealthState::Healthy => {
                if failures >= u64::from(self.config.failure_threshold) {
                    let tripped = self
                        .state
                        .compare_exchange(
                            HealthState::Healthy as u8,
                            HealthState::Degraded as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    if tripped {
                        tracing::warn!(
                            consecutive_failures = failures,
                            "remote rate-limit store marked unhealthy, using in-process fallback"
                        );
                    }
                }
            }
            HealthState::Degraded => {}
        }
    }

    fn last_failure_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.last_failure_nanos.load(Ordering::Acquire))
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Force the `Healthy` state.
    pub fn reset(&self) {
        self.state
            .store(HealthState::Healthy as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::thread;

    fn health(config: HealthConfig) -> (BackendHealth, MockClock) {
        let clock = MockClock::new(UNIX_EPOCH + Duration::from_secs(1_000));
        (BackendHealth::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_initial_state() {
        let (h, _) = health(HealthConfig::default());
        assert_eq!(h.state(), HealthState::Healthy);
        assert_eq!(h.consecutive_failures(), 0);
        assert!(h.allow_remote());
    }

    #[test]
    fn test_default_trips_on_first_failure_and_sticks() {
        let (h, clock) = health(HealthConfig::default());
        h.record_failure();
        assert_eq!(h.state(), HealthState::Degraded);
        assert!(!h.allow_remote());

        clock.advance(Duration::from_secs(86_400));
        assert!(!h.allow_remote());
        assert_eq!(h.state(), HealthState::Degraded);
    }

    #[test]
    fn test_failure_threshold() {
        let (h, _) = health(HealthConfig {
            failure_threshold: 3,
            reprobe_after: None,
        });

        h.record_failure();
        h.record_failure();
        assert_eq!(h.state(), HealthState::Healthy);
        assert_eq!(h.consecutive_failures(), 2);

        h.record_failure();
        assert_eq!(h.state(), HealthState::Degraded);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (h, _) = health(HealthConfig {
            failure_threshold: 3,
            reprobe_after: None,
        });
        h.record_failure();
        h.record_failure();
        h.record_success();
        assert_eq!(h.consecutive_failures(), 0);
        assert_eq!(h.state(), HealthState::Healthy);
    }

    #[test]
    fn test_reprobe_after_timeout() {
        let (h, clock) = health(HealthConfig {
            failure_threshold: 1,
            reprobe_after: Some(Duration::from_secs(30)),
        });
        h.record_failure();

        clock.advance(Duration::from_secs(29));
        assert!(!h.allow_remote());

        clock.advance(Duration::from_secs(1));
        assert!(h.allow_remote());
        assert_eq!(h.state(), HealthState::Probing);

        // Only one trial call at a time
        assert!(!h.allow_remote());
    }

    #[test]
    fn test_probe_success_recovers() {
        let (h, clock) = health(HealthConfig {
            failure_threshold: 1,
            reprobe_after: Some(Duration::from_secs(5)),
        });
        h.record_failure();
        clock.advance(Duration::from_secs(5));
        assert!(h.allow_remote());

        h.record_success();
        assert_eq!(h.state(), HealthState::Healthy);
        assert!(h.allow_remote());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let (h, clock) = health(HealthConfig {
            failure_threshold: 1,
            reprobe_after: Some(Duration::from_secs(5)),
        });
        h.record_failure();
        clock.advance(Duration::from_secs(5));
        assert!(h.allow_remote());

        h.record_failure();
        assert_eq!(h.state(), HealthState::Degraded);
        // The failure restarted the reprobe timer
        assert!(!h.allow_remote());
    }

    #[test]
    fn test_reset() {
        let (h, _) = health(HealthConfig::default());
        h.record_failure();
        h.reset();
        assert_eq!(h.state(), HealthState::Healthy);
        assert_eq!(h.consecutive_failures(), 0);
    }

    #[test]
    fn test_concurrent_failures() {
        let (h, _) = health(HealthConfig {
            failure_threshold: 5,
            reprobe_after: None,
        });
        let h = Arc::new(h);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let h = Arc::clone(&h);
                thread::spawn(move || h.record_failure())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(h.consecutive_failures(), 10);
        assert_eq!(h.state(), HealthState::Degraded);
    }

    #[test]
    fn test_concurrent_probe_single_winner() {
        let (h, clock) = health(HealthConfig {
            failure_threshold: 1,
            reprobe_after: Some(Duration::from_secs(1)),
        });
        h.record_failure();
        clock.advance(Duration::from_secs(2));
        let h = Arc::new(h);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&h);
                thread::spawn(move || h.allow_remote())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(h.state(), HealthState::Probing);
    }
}
