//! Monotonic tick counter driven by the boot core's timer interrupt.

use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::Timer;

/// Counts timer ticks since the scheduler started.
pub struct TickCounter {
    ticks: AtomicU64,
}

impl TickCounter {
    /// Creates a counter at zero.
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Records one tick and returns the new count.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TickCounter {
    fn current_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_up() {
        let counter = TickCounter::new();
        assert_eq!(counter.current_ticks(), 0);
        assert_eq!(counter.tick(), 1);
        assert_eq!(counter.tick(), 2);
        assert_eq!(counter.current_ticks(), 2);
    }
}
