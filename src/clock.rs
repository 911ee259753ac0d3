//! Clocks for pipe synchronization.
//!
//! All dates in Sluice are expressed in ticks of a 27 MHz clock, the
//! resolution used by MPEG system clocks. This module provides:
//! - [`UCLOCK_FREQ`] and tick/[`Duration`] conversions
//! - [`Clock`]: Trait for time sources, shared with pipes through the
//!   `Uclock` request
//! - [`SystemClock`]: Monotonic system clock
//! - [`ManualClock`]: Clock advanced by hand, for tests and offline processing

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ticks per second.
pub const UCLOCK_FREQ: u64 = 27_000_000;

/// Convert a duration to ticks, saturating at `u64::MAX`.
pub fn ticks_from_duration(duration: Duration) -> u64 {
    let ticks = duration.as_nanos() * u128::from(UCLOCK_FREQ) / 1_000_000_000;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// Convert ticks to a duration.
pub fn duration_from_ticks(ticks: u64) -> Duration {
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(UCLOCK_FREQ);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

// ============================================================================
// Clock Trait
// ============================================================================

/// A clock that provides the current date in 27 MHz ticks.
///
/// Implementations should provide monotonic time (never goes backwards).
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current date in ticks.
    fn now(&self) -> u64;

    /// Get a human-readable name for the clock.
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// System monotonic clock.
///
/// Time is relative to when the clock was created.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
    name: String,
}

impl SystemClock {
    /// Create a new system clock with the current instant as epoch.
    pub fn new() -> Self {
        Self::with_name("system-monotonic")
    }

    /// Create a system clock with a custom name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            epoch: Instant::now(),
            name: name.into(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> u64 {
        ticks_from_duration(self.epoch.elapsed())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock at date `start`.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Set the current date.
    pub fn set(&self, date: u64) {
        self.now.store(date, Ordering::Release);
    }

    /// Move the clock forward by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        "manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_conversions() {
        assert_eq!(ticks_from_duration(Duration::from_secs(1)), UCLOCK_FREQ);
        assert_eq!(ticks_from_duration(Duration::from_millis(40)), 1_080_000);
        assert_eq!(duration_from_ticks(UCLOCK_FREQ / 2), Duration::from_millis(500));
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        let t2 = clock.now();
        assert!(t2 > t1);
        assert_eq!(clock.name(), "system-monotonic");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }
}
