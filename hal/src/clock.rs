//! # Clock
//!
//! Monotonic tick source. Real ports drive it from the timer interrupt;
//! tests advance it by hand.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks per second of the system clock
pub const HZ: u64 = 100;

/// A monotonic time source
pub trait Clock: Send + Sync + core::fmt::Debug {
    /// Ticks since boot
    fn now_ticks(&self) -> u64;

    /// Whole seconds since boot
    fn now_secs(&self) -> u64 {
        self.now_ticks() / HZ
    }
}

/// Clock driven by explicit tick calls
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: AtomicU64,
}

impl TickClock {
    /// Clock starting at zero
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// One timer interrupt
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Jump forward by `ticks`
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl Clock for TickClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_clock() {
        let clock = TickClock::new();
        clock.tick();
        clock.advance(HZ * 2);
        assert_eq!(clock.now_ticks(), HZ * 2 + 1);
        assert_eq!(clock.now_secs(), 2);
    }
}
