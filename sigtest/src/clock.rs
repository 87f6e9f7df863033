//! Wall-clock and uptime sampling.
//!
//! Signals carry the sender's wall-clock time split into whole seconds and a
//! millisecond remainder; the receiver samples its own wall clock on arrival
//! and the difference is reported as the delivery latency.  Both sides are
//! assumed to have roughly synchronised clocks; skew shows up as-is in the
//! latency figure.
//!
//! The [`Clock`] trait exists so tests can pin time with [`ManualClock`].

use std::sync::{Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A wall-clock sample with millisecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: u64,
    /// Millisecond remainder, `0..1000`.
    pub millis: u16,
}

impl Timestamp {
    pub fn new(seconds: u64, millis: u16) -> Self {
        Self { seconds, millis }
    }

    /// Convert a [`SystemTime`]; times before the epoch collapse to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs(),
            millis: since_epoch.subsec_millis() as u16,
        }
    }

    /// Milliseconds elapsed from `earlier` to `self`.
    ///
    /// The result is negative when `earlier` lies in the future (clock skew
    /// between peers); callers report it uninterpreted.
    pub fn millis_since(&self, earlier: Timestamp) -> i64 {
        let secs = self.seconds as i64 - earlier.seconds as i64;
        let millis = i64::from(self.millis) - i64::from(earlier.millis);
        secs * 1000 + millis
    }
}

/// Source of wall-clock samples and a monotonic uptime counter.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Milliseconds since this clock was created.  Never goes backwards.
    fn uptime_ms(&self) -> u64;
}

/// The real system clock.
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    inner: Mutex<(Timestamp, u64)>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            inner: Mutex::new((start, 0)),
        }
    }

    /// Move both the wall clock and the uptime counter forward by `ms`.
    pub fn advance(&self, ms: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let total_millis = u64::from(inner.0.millis) + ms;
        inner.0.seconds += total_millis / 1000;
        inner.0.millis = (total_millis % 1000) as u16;
        inner.1 += ms;
    }

    /// Jump the wall clock to `at` without touching uptime.
    pub fn set(&self, at: Timestamp) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0 = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn uptime_ms(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn millis_since_combines_seconds_and_millis() {
        let sent = Timestamp::new(100, 900);
        let now = Timestamp::new(102, 150);
        assert_eq!(now.millis_since(sent), 1250);
    }

    #[test]
    fn millis_since_can_go_negative() {
        let sent = Timestamp::new(200, 0);
        let now = Timestamp::new(199, 500);
        assert_eq!(now.millis_since(sent), -500);
    }

    #[test]
    fn from_system_time_splits_millis() {
        let t = UNIX_EPOCH + Duration::from_millis(5_123);
        assert_eq!(Timestamp::from_system_time(t), Timestamp::new(5, 123));
    }

    #[test]
    fn manual_clock_advance_carries_into_seconds() {
        let clock = ManualClock::new(Timestamp::new(10, 800));
        clock.advance(450);
        assert_eq!(clock.now(), Timestamp::new(11, 250));
        assert_eq!(clock.uptime_ms(), 450);
    }

    #[test]
    fn system_clock_uptime_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.uptime_ms();
        let b = clock.uptime_ms();
        assert!(b >= a);
    }
}
