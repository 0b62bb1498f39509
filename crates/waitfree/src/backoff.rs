use std::hint;
use std::thread;
use std::time::Duration;

/// Adaptive backoff strategy (Crossbeam-style).
///
/// Progressively increases wait time: spin with PAUSE → yield to OS →
/// (for the sleeping variant) exponentially longer capped sleeps.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6; // 2^6 = 64 spins max before yielding
    const YIELD_LIMIT: u32 = 10;

    /// Longest single sleep `stall` will take, in microseconds.
    ///
    /// Tunable; the full-ring advance path is the only caller that can
    /// reach it.
    const STALL_CAP_US: u64 = 1_000_000;

    /// Creates a new backoff instance.
    #[inline]
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Light spin with PAUSE hints.
    #[inline]
    pub fn spin(&mut self) {
        let spins = 1 << self.step.min(Self::SPIN_LIMIT);
        for _ in 0..spins {
            hint::spin_loop();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Heavier backoff: spin then yield.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            self.spin();
        } else {
            thread::yield_now();
            if self.step <= Self::YIELD_LIMIT {
                self.step += 1;
            }
        }
    }

    /// Blocking backoff: spin, then sleep for exponentially longer
    /// intervals, capped at [`STALL_CAP_US`](Self::STALL_CAP_US).
    ///
    /// Used only where an operation must wait out a competing CAS storm
    /// and is explicitly allowed to block.
    pub fn stall(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            self.spin();
            return;
        }
        let exp = (self.step - Self::SPIN_LIMIT).min(20);
        let us = (1u64 << exp).min(Self::STALL_CAP_US);
        thread::sleep(Duration::from_micros(us));
        if self.step < u32::MAX {
            self.step += 1;
        }
    }

    /// Check if we've exhausted the spin/yield budget.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }

    /// Reset for next wait cycle.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
