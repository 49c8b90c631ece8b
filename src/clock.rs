//! Time sources for limiter evaluations.
//!
//! The limiter reads the clock once per evaluation and hands the value to the
//! store routine as an argument, so the routine never consults a clock of its
//! own.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A source of wall-clock timestamps in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Current time in nanoseconds.
    fn now_nanos(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        let now = chrono::Utc::now();
        // Out of range only after the year 2262.
        now.timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp().saturating_mul(NANOS_PER_SEC))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(start_nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(start_nanos),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(delta)));
    }

    /// Jump to an absolute instant, possibly in the past.
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_nanos(), 1_000 + 2 * NANOS_PER_SEC);
    }

    #[test]
    fn test_manual_clock_set_backwards() {
        let clock = ManualClock::new(5 * NANOS_PER_SEC);
        clock.set(NANOS_PER_SEC);
        assert_eq!(clock.now_nanos(), NANOS_PER_SEC);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_nanos() > 1_577_836_800 * NANOS_PER_SEC);
    }
}
