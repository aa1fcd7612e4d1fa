//! Conversions between event frequency and the virtual clock's nanosecond grid, plus a small
//! host-clock abstraction frontends can use to pace emulation to wall-clock time.
//!
//! The virtual clock itself — the min-heap of device deadlines — lives in `core86-timers`; this
//! crate only provides the pure `frequency -> cycle_period` arithmetic it's built on, so that
//! both the timing manager and anything else computing a `TimingEvent`'s period agree on the
//! rounding rule.

use core86_types::SimulationTime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Converts an event frequency in Hz to a period in nanoseconds, rounding the way the reference
/// implementation does (`SimulationTime(1e9 / frequency)`, i.e. truncating towards zero).
pub fn cycle_period_ns(frequency_hz: f64) -> SimulationTime {
    debug_assert!(frequency_hz > 0.0);
    (1_000_000_000.0 / frequency_hz) as SimulationTime
}

/// A source of monotonic wall-clock nanoseconds. Implemented by [`WallClock`] for real use and by
/// [`FakeHostClock`] for deterministic tests.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// A real wall-clock source backed by `std::time::Instant`.
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for WallClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A deterministic, manually-advanced clock for tests.
#[derive(Default)]
pub struct FakeHostClock {
    ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(initial_ns: u64) -> Self {
        FakeHostClock {
            ns: AtomicU64::new(initial_ns),
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}

/// Shared handle to a [`HostClock`], so multiple consumers (UI pacing, benchmarking) can read the
/// same source without owning it.
pub type SharedHostClock = Arc<dyn HostClock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_matches_known_frequencies() {
        assert_eq!(cycle_period_ns(1_000_000_000.0), 1);
        assert_eq!(cycle_period_ns(1_193_182.0), 838);
    }

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeHostClock::new(10);
        assert_eq!(clock.now_ns(), 10);
        clock.advance_ns(5);
        assert_eq!(clock.now_ns(), 15);
        clock.set_ns(100);
        assert_eq!(clock.now_ns(), 100);
    }
}
