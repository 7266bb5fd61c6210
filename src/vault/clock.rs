//! Vault Clock
//!
//! All accrual math reads time through a `Clock`, never from the system
//! directly, so tests can move time forward deterministically.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Seconds since Unix epoch.
pub type UnixSecs = i64;

pub const SECS_PER_DAY: i64 = 86_400;

/// Current-time provider injected into every vault.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> UnixSecs;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> UnixSecs {
        Utc::now().timestamp()
    }
}

/// Manually driven clock for simulations and tests.
///
/// Only moves forward: `advance_by` with a negative delta and `set` to an
/// earlier time are ignored in release builds and assert in debug.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: UnixSecs) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    pub fn advance_by(&self, secs: i64) {
        debug_assert!(secs >= 0, "ManualClock: delta must be non-negative");
        if secs > 0 {
            self.current.fetch_add(secs, Ordering::SeqCst);
        }
    }

    pub fn advance_days(&self, days: i64) {
        self.advance_by(days * SECS_PER_DAY);
    }

    pub fn set(&self, time: UnixSecs) {
        let prev = self.current.fetch_max(time, Ordering::SeqCst);
        debug_assert!(
            time >= prev,
            "ManualClock: cannot go backward from {} to {}",
            prev,
            time
        );
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> UnixSecs {
        self.current.load(Ordering::SeqCst)
    }
}

impl fmt::Display for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_700_000_000);
        clock.advance_by(60);
        assert_eq!(clock.now(), 1_700_000_060);
        clock.advance_days(1);
        assert_eq!(clock.now(), 1_700_000_060 + SECS_PER_DAY);
        clock.set(1_800_000_000);
        assert_eq!(clock.now(), 1_800_000_000);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2023-11-14
        assert!(SystemClock.now() > 1_700_000_000);
    }
}
