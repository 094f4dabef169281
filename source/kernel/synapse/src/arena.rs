// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded slot arena with generation-tagged handles
//! OWNERS: @kernel-team
//! PUBLIC API: Handle, Arena<T, N>, next_generation()
//! INVARIANTS: A removed slot bumps its generation so stale handles never resolve;
//!             at most N values are live; insertion is first-fit

/// Generation values wrap inside 15 bits so raw handles stay non-negative as `i32`.
const GENERATION_MASK: u16 = 0x7fff;

/// Returns the generation that follows `generation`.
#[inline]
pub const fn next_generation(generation: u16) -> u16 {
    generation.wrapping_add(1) & GENERATION_MASK
}

/// Slot index plus the generation the slot had when the handle was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u16,
    generation: u16,
}

impl Handle {
    #[inline]
    pub const fn new(index: usize, generation: u16) -> Self {
        Self { index: index as u16, generation: generation & GENERATION_MASK }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        self.generation
    }

    /// Encodes the handle as the 32-bit value handed to userspace.
    #[inline]
    pub const fn to_raw(self) -> u32 {
        ((self.generation as u32) << 16) | self.index as u32
    }

    /// Decodes a userspace value. Any bit pattern decodes; validity is checked by the owner.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self { index: raw as u16, generation: (raw >> 16) as u16 }
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Fixed-capacity arena. Storage is allocated once at construction.
pub struct Arena<T, const N: usize> {
    slots: [Slot<T>; N],
    live: usize,
}

impl<T, const N: usize> Arena<T, N> {
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|_| Slot { generation: 0, value: None }), live: 0 }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.live == N
    }

    /// Stores `value` in the first free slot; hands the value back when the arena is full.
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        match self.slots.iter_mut().enumerate().find(|(_, slot)| slot.value.is_none()) {
            Some((index, slot)) => {
                slot.value = Some(value);
                self.live += 1;
                Ok(Handle::new(index, slot.generation))
            }
            None => Err(value),
        }
    }

    /// Removes the value named by `handle`; stale or out-of-range handles yield `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = next_generation(slot.generation);
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    /// Iterates live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| (Handle::new(index, slot.generation), value))
        })
    }
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    #[test]
    fn removed_slot_rejects_stale_handle() {
        let mut arena: Arena<u32, 2> = Arena::new();
        let first = arena.insert(7).unwrap();
        assert_eq!(arena.remove(first), Some(7));
        let second = arena.insert(9).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(&9));
    }

    #[test]
    fn raw_encoding_roundtrips_and_stays_positive() {
        let handle = Handle::new(42, 0xffff);
        assert_eq!(handle.generation(), GENERATION_MASK);
        let raw = handle.to_raw();
        assert!((raw as i32) >= 0);
        assert_eq!(Handle::from_raw(raw), handle);
    }

    #[test]
    fn generation_wraps_within_mask() {
        assert_eq!(next_generation(GENERATION_MASK), 0);
        assert_eq!(next_generation(3), 4);
    }

    proptest! {
        #[test]
        fn live_count_bounded_and_insert_fails_only_when_full(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..200)) {
            let mut arena: Arena<u8, 8> = Arena::new();
            let mut live: Vec<Handle> = Vec::new();
            for (insert, pick) in ops {
                if insert {
                    match arena.insert(pick) {
                        Ok(handle) => live.push(handle),
                        Err(_) => prop_assert_eq!(live.len(), 8),
                    }
                } else if !live.is_empty() {
                    let handle = live.swap_remove(pick as usize % live.len());
                    prop_assert!(arena.remove(handle).is_some());
                    prop_assert!(arena.get(handle).is_none());
                }
                prop_assert!(arena.len() <= arena.capacity());
                prop_assert_eq!(arena.len(), live.len());
            }
        }
    }
}
