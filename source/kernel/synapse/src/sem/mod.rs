// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel counting semaphores shared between processes
//! OWNERS: @kernel-sync-team
//! STATUS: Functional
//! API_STABILITY: Stable (handle encoding is user visible)
//! TEST_COVERAGE: Unit tests + property tests (tests_prop.rs)
//! PUBLIC API: SemaphoreTable, SemHandle, SemError
//! DEPENDS_ON: arena::Handle, sync::WaitChannel, spin::Mutex
//! INVARIANTS: Allocation scans only under the table lock; `valid`, `count` and the
//!             generation are touched only under the slot lock; table lock before slot
//!             lock; `count` never goes below zero; no lock is held while sleeping
//!
//! Destroying a semaphore that still has blocked waiters is the caller's
//! responsibility. Those waiters are not woken by the destroy; whenever they next
//! wake they observe the changed generation and fail with
//! [`SemError::InvalidHandle`].

use spin::Mutex;

use crate::arena::{next_generation, Handle};
use crate::config::NSEM;
use crate::sync::{Sleeper, WaitChannel};

/// Opaque semaphore identity handed to userspace (index + generation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SemHandle(Handle);

impl SemHandle {
    pub const fn to_raw(self) -> u32 {
        self.0.to_raw()
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(Handle::from_raw(raw))
    }

    pub const fn index(self) -> usize {
        self.0.index()
    }
}

/// Errors reported by semaphore operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemError {
    /// Every slot is in use.
    Exhausted,
    /// Handle is out of range, destroyed, or from an older generation.
    InvalidHandle,
    /// Rejected argument (sharing mode or initial value).
    InvalidArgument,
    /// `post` would overflow the counter.
    Overflow,
    /// Caller was killed while blocked in `wait`.
    Killed,
}

struct SemState {
    valid: bool,
    generation: u16,
    count: u32,
}

impl SemState {
    fn matches(&self, handle: SemHandle) -> bool {
        self.valid && self.generation == handle.0.generation()
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.count = 0;
        self.generation = next_generation(self.generation);
    }
}

struct Slot {
    state: Mutex<SemState>,
    waiters: WaitChannel,
}

/// Fixed-capacity semaphore registry.
pub struct SemaphoreTable<const N: usize = NSEM> {
    alloc: Mutex<()>,
    slots: [Slot; N],
}

impl<const N: usize> SemaphoreTable<N> {
    pub fn new() -> Self {
        Self {
            alloc: Mutex::new(()),
            slots: core::array::from_fn(|_| Slot {
                state: Mutex::new(SemState { valid: false, generation: 0, count: 0 }),
                waiters: WaitChannel::new(),
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Claims the first free slot. The new semaphore starts with a count of zero.
    #[must_use]
    pub fn allocate(&self) -> Result<SemHandle, SemError> {
        let _scan = self.alloc.lock();
        for (index, slot) in self.slots.iter().enumerate() {
            let mut state = slot.state.lock();
            if !state.valid {
                state.valid = true;
                state.count = 0;
                return Ok(SemHandle(Handle::new(index, state.generation)));
            }
        }
        Err(SemError::Exhausted)
    }

    /// Releases a slot. Out-of-range and stale handles are ignored.
    pub fn deallocate(&self, handle: SemHandle) {
        let Some(slot) = self.slots.get(handle.index()) else {
            log_debug!(target: "sem", "deallocate: index {} out of range", handle.index());
            return;
        };
        let mut state = slot.state.lock();
        if state.matches(handle) {
            state.invalidate();
        }
    }

    /// Sets the initial count of a freshly allocated semaphore.
    #[must_use]
    pub fn init(&self, handle: SemHandle, value: u32) -> Result<(), SemError> {
        let slot = self.slot(handle)?;
        let mut state = slot.state.lock();
        if !state.matches(handle) {
            return Err(SemError::InvalidHandle);
        }
        state.count = value;
        Ok(())
    }

    /// Decrements the count, blocking while it is zero.
    #[must_use]
    pub fn wait(&self, handle: SemHandle, sleeper: &dyn Sleeper) -> Result<(), SemError> {
        let slot = self.slot(handle)?;
        let mut state = slot.state.lock();
        loop {
            if !state.matches(handle) {
                return Err(SemError::InvalidHandle);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            if sleeper.killed() {
                return Err(SemError::Killed);
            }
            state = slot.waiters.sleep(&slot.state, state, sleeper);
        }
    }

    /// Increments the count and wakes every waiter on the slot.
    #[must_use]
    pub fn post(&self, handle: SemHandle) -> Result<(), SemError> {
        let slot = self.slot(handle)?;
        let mut state = slot.state.lock();
        if !state.matches(handle) {
            return Err(SemError::InvalidHandle);
        }
        state.count = state.count.checked_add(1).ok_or(SemError::Overflow)?;
        slot.waiters.wake_all();
        Ok(())
    }

    /// Invalidates the semaphore. Blocked waiters are not woken.
    #[must_use]
    pub fn destroy(&self, handle: SemHandle) -> Result<(), SemError> {
        let slot = self.slot(handle)?;
        let mut state = slot.state.lock();
        if !state.matches(handle) {
            return Err(SemError::InvalidHandle);
        }
        state.invalidate();
        Ok(())
    }

    /// Current count of a live semaphore.
    pub fn count(&self, handle: SemHandle) -> Result<u32, SemError> {
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        if !state.matches(handle) {
            return Err(SemError::InvalidHandle);
        }
        Ok(state.count)
    }

    /// Number of allocated slots.
    pub fn in_use(&self) -> usize {
        let _scan = self.alloc.lock();
        self.slots.iter().filter(|slot| slot.state.lock().valid).count()
    }

    fn slot(&self, handle: SemHandle) -> Result<&Slot, SemError> {
        self.slots.get(handle.index()).ok_or(SemError::InvalidHandle)
    }
}

impl<const N: usize> Default for SemaphoreTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(SemaphoreTable<4>: Send, Sync);


#[cfg(test)]
mod tests_prop;
