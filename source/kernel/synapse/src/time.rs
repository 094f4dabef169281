// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Global tick counter advanced by the timekeeping hart, plus tick-based sleep.
//!
//! The counter is bumped from the timer interrupt, so it is a bare atomic: a hart
//! interrupted inside `now` or `sleep` must never hold anything `tick` needs.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::{Killed, Sleeper, WaitChannel};

/// Monotonic tick counter with a wait channel for sleepers.
pub struct TickClock {
    ticks: AtomicU64,
    chan: WaitChannel,
}

impl TickClock {
    pub const fn new() -> Self {
        Self { ticks: AtomicU64::new(0), chan: WaitChannel::new() }
    }

    /// Advances the clock by one tick and wakes every sleeper.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.chan.wake_all();
    }

    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Blocks until `n` ticks have elapsed. Returns early with [`Killed`] once the
    /// sleeper is marked killed.
    #[must_use]
    pub fn sleep(&self, n: u64, sleeper: &dyn Sleeper) -> Result<(), Killed> {
        let start = self.now();
        self.chan.wait_until(sleeper, || self.now().wrapping_sub(start) >= n)
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}
