//! Wall-clock and monotonic time in milliseconds.
//!
//! The timeline that activates and expires collection schemes is driven by
//! system time — a scheme's start/expiry are absolute points in time, so a
//! jumping system clock must move activations with it. Interval measurement
//! (request timers, idle waits) uses the monotonic side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// A pair of wall and monotonic readings taken at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePoint {
    pub system_time_ms: Timestamp,
    pub monotonic_time_ms: u64,
}

impl TimePoint {
    /// Translates an absolute system time into a TimePoint relative to a
    /// reference reading, keeping the system/monotonic offset consistent.
    pub fn from_system_time(reference: TimePoint, system_time_ms: Timestamp) -> Self {
        let delta = system_time_ms as i128 - reference.system_time_ms as i128;
        let monotonic = (reference.monotonic_time_ms as i128 + delta).max(0) as u64;
        TimePoint {
            system_time_ms,
            monotonic_time_ms: monotonic,
        }
    }
}

/// Time source for the whole agent. Abstracted so scheduling logic can be
/// tested against a manually advanced clock.
pub trait Clock: Send + Sync + 'static {
    /// Wall-clock milliseconds since the Unix epoch.
    fn system_time_ms(&self) -> Timestamp;

    /// Monotonic milliseconds since an arbitrary process-local origin.
    fn monotonic_ms(&self) -> u64;

    fn time_point(&self) -> TimePoint {
        TimePoint {
            system_time_ms: self.system_time_ms(),
            monotonic_time_ms: self.monotonic_ms(),
        }
    }
}

/// Production clock backed by `SystemTime` and `Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn system_time_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }

    fn monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests.
pub struct TestClock {
    system_ms: AtomicU64,
    monotonic_ms: AtomicU64,
}

impl TestClock {
    pub fn new(start_system_ms: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            system_ms: AtomicU64::new(start_system_ms),
            monotonic_ms: AtomicU64::new(0),
        })
    }

    /// Advances both wall and monotonic time.
    pub fn advance(&self, delta_ms: u64) {
        self.system_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.monotonic_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jumps the wall clock without touching monotonic time.
    pub fn set_system_time(&self, system_ms: Timestamp) {
        self.system_ms.store(system_ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn system_time_ms(&self) -> Timestamp {
        self.system_ms.load(Ordering::SeqCst)
    }

    fn monotonic_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
        assert!(clock.system_time_ms() > 1_600_000_000_000);
    }

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.system_time_ms(), 1_500);
        assert_eq!(clock.monotonic_ms(), 500);
        clock.set_system_time(10_000);
        assert_eq!(clock.system_time_ms(), 10_000);
        assert_eq!(clock.monotonic_ms(), 500);
    }

    #[test]
    fn timepoint_translation_keeps_offset() {
        let reference = TimePoint {
            system_time_ms: 10_000,
            monotonic_time_ms: 2_000,
        };
        let later = TimePoint::from_system_time(reference, 13_000);
        assert_eq!(later.monotonic_time_ms, 5_000);
        let earlier = TimePoint::from_system_time(reference, 500);
        assert_eq!(earlier.monotonic_time_ms, 0);
    }
}
