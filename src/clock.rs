//! Time sources for TTL expiry and metadata timestamps.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> SystemTime;

    /// Current time as whole seconds since the Unix epoch.
    fn unix_now(&self) -> u64 {
        unix_secs(self.now())
    }
}

/// Convert a `SystemTime` to whole seconds since the Unix epoch.
///
/// Times before the epoch clamp to zero.
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
///
/// Shared between a store and its backend to simulate TTL expiry.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    /// Create a clock frozen at the current system time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Create a clock frozen at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at(UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.unix_now(), 100);

        clock.advance(Duration::from_secs(11));
        assert_eq!(clock.unix_now(), 111);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let before = other.unix_now();

        clock.advance(Duration::from_secs(60));
        assert_eq!(other.unix_now(), before + 60);
    }

    #[test]
    fn test_unix_secs_before_epoch() {
        let early = UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(unix_secs(early), 0);
    }
}
