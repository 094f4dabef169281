// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Wait channels replacing address-keyed sleep/wakeup
//! OWNERS: @kernel-sync-team
//! PUBLIC API: WaitChannel, Sleeper, Killed, set_park_hook(), park_current()
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: The wake sequence is sampled while the caller still holds its lock, so a
//!             wake issued after the caller's check is never lost; waiters re-acquire the
//!             lock before returning; a killed sleeper stops waiting at the next wake-up
//!
//! `spin::Mutex` does not mask interrupts. State touched from interrupt context (the
//! tick counter, wake sequences) is atomic and lock-free; any lock an interrupt
//! handler does take must only be acquired under `arch::riscv::without_interrupts`
//! everywhere else, or the handler can spin on its own hart forever.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// Execution context that can block on a [`WaitChannel`].
pub trait Sleeper {
    /// Returns true once the context has been marked for termination.
    fn killed(&self) -> bool;
    /// Gives up the hart until something may have changed.
    fn park(&self);
}

/// Returned by blocking operations when the sleeper was killed while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Killed;

/// Broadcast condition scoped to one resource.
pub struct WaitChannel {
    seq: AtomicU64,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { seq: AtomicU64::new(0) }
    }

    /// Releases `guard`, blocks until [`WaitChannel::wake_all`] runs or the sleeper is
    /// killed, then re-acquires `lock`. Callers must re-check their condition.
    pub fn sleep<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        sleeper: &dyn Sleeper,
    ) -> MutexGuard<'a, T> {
        let seen = self.seq.load(Ordering::Acquire);
        drop(guard);
        while self.seq.load(Ordering::Acquire) == seen && !sleeper.killed() {
            sleeper.park();
        }
        lock.lock()
    }

    /// Blocks until `done` holds, re-checking after every wake-up. For state updated
    /// lock-free: the wake sequence is sampled before `done` is evaluated, so an update
    /// followed by [`WaitChannel::wake_all`] in between is never missed.
    pub fn wait_until(
        &self,
        sleeper: &dyn Sleeper,
        mut done: impl FnMut() -> bool,
    ) -> Result<(), Killed> {
        loop {
            let seen = self.seq.load(Ordering::SeqCst);
            if done() {
                return Ok(());
            }
            if sleeper.killed() {
                return Err(Killed);
            }
            while self.seq.load(Ordering::SeqCst) == seen && !sleeper.killed() {
                sleeper.park();
            }
        }
    }

    /// Wakes every sleeper currently blocked on this channel.
    pub fn wake_all(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn relax() {
    core::hint::spin_loop();
}

static PARK_HOOK: Mutex<fn()> = Mutex::new(relax);

/// Installs the routine tasks use to give up the hart while blocked
/// (the scheduler's yield on the target, a thread yield on the host).
pub fn set_park_hook(hook: fn()) {
    *PARK_HOOK.lock() = hook;
}

/// Runs the installed park routine for the current execution context.
pub fn park_current() {
    let hook = *PARK_HOOK.lock();
    hook();
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Sleeper;
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Host sleeper backed by `std::thread::yield_now`.
    #[derive(Default)]
    pub struct ThreadSleeper {
        killed: AtomicBool,
    }

    impl ThreadSleeper {
        pub fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    impl Sleeper for ThreadSleeper {
        fn killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }

        fn park(&self) {
            std::thread::yield_now();
        }
    }
}
