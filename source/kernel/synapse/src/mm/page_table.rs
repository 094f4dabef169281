// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! The root page lives on the kernel heap, one per address space. Interior table
//! pages come from the frame allocator passed to [`PageTable::map`] and go back
//! through [`PageTable::release`]. Leaf frames belong to the caller and are never
//! freed here.

use alloc::{boxed::Box, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

use super::{frame::FrameAllocator, PhysAddr, PAGE_SIZE};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const LEVELS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Installation was refused (failpoint).
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No frame was left for an intermediate table page.
    OutOfMemory,
}

#[repr(align(4096))]
struct PageTablePage {
    entries: [usize; PT_ENTRIES],
}

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: NonNull<PageTablePage>,
    #[cfg(feature = "failpoints")]
    deny_next_map: bool,
}

// SAFETY: table pages are uniquely owned by this value and only reached through `&self`/`&mut self`.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new() -> Self {
        let boxed = Box::new(PageTablePage::new());
        // SAFETY: Box never yields a null pointer.
        let root = unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) };
        Self {
            root,
            #[cfg(feature = "failpoints")]
            deny_next_map: false,
        }
    }

    /// Looks up the raw leaf entry mapped at `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (0..LEVELS).rev() {
            // SAFETY: `table` is either the root or a child installed by `map`.
            let entry = unsafe { (*table.as_ptr()).entries[indices[level]] };
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            let is_leaf = entry & LEAF_PERMS.bits() != 0;
            if level == 0 {
                return if is_leaf { Some(entry) } else { None };
            }
            if is_leaf {
                return None;
            }
            table = NonNull::new(entry_table(entry))?;
        }
        None
    }

    /// Translates `va` (page aligned) into the mapped frame and its flags.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PageFlags)> {
        self.lookup(va).map(|entry| (entry_pa(entry), PageFlags::from_bits_truncate(entry)))
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    ///
    /// Missing intermediate levels are taken from `frames`; when it runs dry the
    /// call fails with [`MapError::OutOfMemory`] and no leaf is written. Levels
    /// created before the failure stay linked until [`PageTable::release`].
    pub fn map(
        &mut self,
        va: usize,
        pa: PhysAddr,
        flags: PageFlags,
        frames: &dyn FrameAllocator,
    ) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        // Sv39 reserves writable-but-unreadable leaves.
        if flags.contains(PageFlags::WRITE) && !flags.contains(PageFlags::READ) {
            return Err(MapError::InvalidFlags);
        }
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.deny_next_map) {
            return Err(MapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (0..LEVELS).rev() {
            // SAFETY: `table` is either the root or a child installed below.
            let entry = unsafe { &mut (*table.as_ptr()).entries[indices[level]] };
            if level == 0 {
                if *entry & PageFlags::VALID.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                *entry = ((pa / PAGE_SIZE) << 10) | flags.bits();
                return Ok(());
            }

            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                table = NonNull::new(entry_table(*entry)).ok_or(MapError::OutOfRange)?;
                continue;
            }

            let next = frames.alloc_zeroed().ok_or(MapError::OutOfMemory)?;
            *entry = ((next / PAGE_SIZE) << 10) | PageFlags::VALID.bits();
            table = NonNull::new(next as *mut PageTablePage).ok_or(MapError::OutOfMemory)?;
        }
        Ok(())
    }

    /// Removes the leaf mapping at `va`, returning the frame it pointed to.
    pub fn unmap(&mut self, va: usize) -> Option<PhysAddr> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            // SAFETY: see `lookup`.
            let entry = unsafe { (*table.as_ptr()).entries[indices[level]] };
            if entry & PageFlags::VALID.bits() == 0 || entry & LEAF_PERMS.bits() != 0 {
                return None;
            }
            table = NonNull::new(entry_table(entry))?;
        }
        // SAFETY: `table` is a level-0 page owned by `self`.
        let slot = unsafe { &mut (*table.as_ptr()).entries[indices[0]] };
        if *slot & PageFlags::VALID.bits() == 0 {
            return None;
        }
        let pa = entry_pa(*slot);
        *slot = 0;
        crate::arch::riscv::flush_tlb();
        Some(pa)
    }

    /// Collects every leaf mapping with `start <= va < end`, in address order.
    pub fn leaves(&self, start: usize, end: usize) -> Vec<(usize, PhysAddr)> {
        let mut out = Vec::new();
        if start < end {
            collect_leaves(self.root, LEVELS - 1, 0, start, end, &mut out);
        }
        out
    }

    /// Makes the next `map` call fail with [`MapError::PermissionDenied`].
    #[cfg(feature = "failpoints")]
    pub fn deny_next_map(&mut self) {
        self.deny_next_map = true;
    }

    /// Returns every intermediate table page to `frames` and clears the root.
    ///
    /// Leaf frames are not touched; callers unmap and free them first.
    pub fn release(&mut self, frames: &dyn FrameAllocator) -> usize {
        let released = release_tables(self.root, LEVELS - 1, frames);
        if released > 0 {
            crate::arch::riscv::flush_tlb();
        }
        released
    }
}

/// Frees the child tables below `table` and returns how many pages went back.
fn release_tables(
    table: NonNull<PageTablePage>,
    level: usize,
    frames: &dyn FrameAllocator,
) -> usize {
    if level == 0 {
        return 0;
    }
    let mut released = 0;
    for index in 0..PT_ENTRIES {
        // SAFETY: `table` is the root or an interior page reached from it.
        let entry = unsafe { &mut (*table.as_ptr()).entries[index] };
        if *entry & PageFlags::VALID.bits() == 0 || *entry & LEAF_PERMS.bits() != 0 {
            continue;
        }
        if let Some(child) = NonNull::new(entry_table(*entry)) {
            released += release_tables(child, level - 1, frames);
            frames.free(child.as_ptr() as usize);
            released += 1;
        }
        *entry = 0;
    }
    released
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        // SAFETY: `root` came from `Box::into_raw` in `new` and is dropped once.
        unsafe { drop(Box::from_raw(self.root.as_ptr())) };
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

fn collect_leaves(
    table: NonNull<PageTablePage>,
    level: usize,
    base: usize,
    start: usize,
    end: usize,
    out: &mut Vec<(usize, PhysAddr)>,
) {
    let span = PAGE_SIZE << (9 * level);
    for index in 0..PT_ENTRIES {
        let lo = base + index * span;
        if lo >= end {
            break;
        }
        if lo + span <= start {
            continue;
        }
        // SAFETY: `table` is owned by the page table being walked.
        let entry = unsafe { (*table.as_ptr()).entries[index] };
        if entry & PageFlags::VALID.bits() == 0 {
            continue;
        }
        if level == 0 {
            out.push((lo, entry_pa(entry)));
        } else if entry & LEAF_PERMS.bits() == 0 {
            if let Some(child) = NonNull::new(entry_table(entry)) {
                collect_leaves(child, level - 1, lo, start, end, out);
            }
        }
    }
}

#[inline]
fn entry_pa(entry: usize) -> PhysAddr {
    ((entry >> 10) & ((1 << 44) - 1)) << 12
}

#[inline]
fn entry_table(entry: usize) -> *mut PageTablePage {
    entry_pa(entry) as *mut PageTablePage
}

fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn0, vpn1, vpn2]
}

pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::mm::frame::test_pool;

    const USER_RW: PageFlags = PageFlags::VALID
        .union(PageFlags::READ)
        .union(PageFlags::WRITE)
        .union(PageFlags::USER);

    #[test]
    fn map_translate_unmap() {
        let frames = test_pool(2);
        let mut table = PageTable::new();
        table.map(0x4000_0000, 0x8020_0000, USER_RW, &frames).unwrap();
        assert_eq!(frames.free_frames(), 0);
        let (pa, flags) = table.translate(0x4000_0000).unwrap();
        assert_eq!(pa, 0x8020_0000);
        assert!(flags.contains(PageFlags::USER | PageFlags::WRITE));
        assert_eq!(table.translate(0x4000_1000), None);
        assert_eq!(table.unmap(0x4000_0000), Some(0x8020_0000));
        assert_eq!(table.translate(0x4000_0000), None);
        assert_eq!(table.unmap(0x4000_0000), None);
        assert_eq!(table.release(&frames), 2);
        assert_eq!(frames.free_frames(), 2);
    }

    #[test]
    fn rejects_overlap_and_bad_arguments() {
        let frames = test_pool(2);
        let mut table = PageTable::new();
        table.map(0x1000, 0x2000, USER_RW, &frames).unwrap();
        assert_eq!(table.map(0x1000, 0x3000, USER_RW, &frames), Err(MapError::Overlap));
        assert_eq!(table.map(0x1001, 0x3000, USER_RW, &frames), Err(MapError::Unaligned));
        assert_eq!(table.map(0x2000, 0x3000, PageFlags::VALID, &frames), Err(MapError::InvalidFlags));
        assert_eq!(
            table.map(0x2000, 0x3000, PageFlags::VALID | PageFlags::WRITE, &frames),
            Err(MapError::InvalidFlags)
        );
        assert_eq!(table.map(1 << 40, 0x3000, USER_RW, &frames), Err(MapError::OutOfRange));
    }

    #[test]
    fn writable_executable_leaves_are_allowed() {
        let frames = test_pool(2);
        let mut table = PageTable::new();
        let rwx = USER_RW | PageFlags::EXECUTE;
        assert_eq!(table.map(0x0, 0x5000, rwx, &frames), Ok(()));
    }

    #[test]
    fn leaves_walks_only_the_requested_window() {
        // One L1 and two L0 tables for the low gigabyte, a pair for the next one.
        let frames = test_pool(5);
        let mut table = PageTable::new();
        for (i, va) in [0x0usize, 0x1000, 0x20_0000, 0x4000_0000].iter().enumerate() {
            table.map(*va, 0x10_0000 + i * PAGE_SIZE, USER_RW, &frames).unwrap();
        }
        assert_eq!(frames.free_frames(), 0);
        let all = table.leaves(0, 1 << 38);
        assert_eq!(all.len(), 4);
        assert_eq!(all[2], (0x20_0000, 0x10_2000));
        assert_eq!(table.leaves(0x1000, 0x20_0000), vec![(0x1000, 0x10_1000)]);
        assert!(table.leaves(0x5000, 0x5000).is_empty());
    }

    #[test]
    fn table_exhaustion_is_an_error_not_an_abort() {
        let frames = test_pool(3);
        let mut table = PageTable::new();
        table.map(0, 0x9000, USER_RW, &frames).unwrap();
        // Each further 2 MiB stride needs its own L0 table.
        table.map(0x20_0000, 0xa000, USER_RW, &frames).unwrap();
        assert_eq!(table.map(0x40_0000, 0xb000, USER_RW, &frames), Err(MapError::OutOfMemory));
        assert_eq!(table.translate(0x40_0000), None);
        assert_eq!(table.translate(0x20_0000).map(|(pa, _)| pa), Some(0xa000));

        // A fresh gigabyte fails after linking nothing it cannot allocate.
        assert_eq!(table.map(0x4000_0000, 0xc000, USER_RW, &frames), Err(MapError::OutOfMemory));
        assert_eq!(frames.free_frames(), 0);

        table.unmap(0);
        table.unmap(0x20_0000);
        assert_eq!(table.release(&frames), 3);
        assert_eq!(frames.free_frames(), 3);
        assert_eq!(table.translate(0x20_0000), None);
    }

    #[test]
    fn interior_level_survives_a_failed_leaf_table() {
        let frames = test_pool(1);
        let mut table = PageTable::new();
        // The L1 page fits, the L0 page does not.
        assert_eq!(table.map(0x4000_0000, 0x9000, USER_RW, &frames), Err(MapError::OutOfMemory));
        assert_eq!(frames.free_frames(), 0);
        assert_eq!(table.release(&frames), 1);
        assert_eq!(frames.free_frames(), 1);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn deny_next_map_fails_once() {
        let frames = test_pool(2);
        let mut table = PageTable::new();
        table.deny_next_map();
        assert_eq!(table.map(0x1000, 0x2000, USER_RW, &frames), Err(MapError::PermissionDenied));
        assert_eq!(frames.free_frames(), 2);
        assert_eq!(table.map(0x1000, 0x2000, USER_RW, &frames), Ok(()));
    }
}
