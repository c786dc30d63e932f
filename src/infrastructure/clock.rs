//! Wall-clock time source.
//!
//! Rate-limit state may be shared with other processes through the remote
//! store, so limiters read wall-clock time rather than a monotonic instant.
//! Tests substitute `MockClock` from `crate::infrastructure::mocks`
//! (feature `test-helpers`).

use crate::application::ports::Clock;
use std::time::SystemTime;

/// [`Clock`] backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// The system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_reads_wall_clock() {
        let before = SystemTime::now();
        let read = SystemClock::new().now();
        let after = SystemTime::now();

        assert!(before <= read && read <= after);
        assert!(read.duration_since(UNIX_EPOCH).unwrap() > Duration::from_secs(1_600_000_000));
    }
}
