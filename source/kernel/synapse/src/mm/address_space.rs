// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task user address space (break, Sv39 table, region table)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, AddressSpaceError, PageInstall, InstallOutcome, CopyFault
//! DEPENDS_ON: mm::page_table, mm::mmr, mm::frame
//! INVARIANTS: [0, size) and every region are disjoint and below USER_TOP; PageInstall
//!             only ever adds a translation or confirms an identical one

use alloc::vec::Vec;

use super::family::FamilyError;
use super::fault::FaultError;
use super::frame::FrameAllocator;
use super::mmr::{Mmr, MmrError, MmrHandle, MmrTable, Prot};
use super::page_table::{MapError, PageFlags, PageTable};
use super::{is_page_aligned, page_round_down, page_round_up, PhysAddr, PAGE_SIZE};
use crate::config::USER_TOP;

/// Leaf flags for break pages.
pub const BREAK_FLAGS: PageFlags = PageFlags::VALID
    .union(PageFlags::READ)
    .union(PageFlags::WRITE)
    .union(PageFlags::EXECUTE)
    .union(PageFlags::USER);

/// Errors reported while managing an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
    /// Range leaves the user window.
    OutOfRange,
    /// Range collides with the break or another region.
    Overlap,
    /// Region table is full.
    TableFull,
    /// Region handle is stale.
    NoSuchRegion,
    /// Underlying map operation failed.
    Mapping(MapError),
    /// Region could not leave its family and still shares its frames.
    Family(FamilyError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl From<FamilyError> for AddressSpaceError {
    fn from(value: FamilyError) -> Self {
        Self::Family(value)
    }
}

impl From<MmrError> for AddressSpaceError {
    fn from(value: MmrError) -> Self {
        match value {
            MmrError::TableFull => Self::TableFull,
            MmrError::NoSuchRegion => Self::NoSuchRegion,
        }
    }
}

/// Request to install an already-owned frame into another task's table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInstall {
    pub va: usize,
    pub pa: PhysAddr,
    pub flags: PageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The same frame was already mapped at that address.
    AlreadyPresent,
}

/// Why a user copy stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyFault {
    /// No translation for this page yet; it may be demand-faulted.
    Unmapped(usize),
    /// Page is mapped without the needed user permission, or lies outside user space.
    Denied(usize),
}

/// Failure of a kernel-initiated user copy after demand faulting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyError {
    /// Address is not accessible from user mode with the needed rights.
    BadAddress(usize),
    /// The page could not be faulted in.
    Fault(FaultError),
}

/// User address space of one task.
pub struct AddressSpace {
    size: usize,
    table: PageTable,
    regions: MmrTable,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self { size: 0, table: PageTable::new(), regions: MmrTable::new() }
    }

    /// Current break.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn regions(&self) -> &MmrTable {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut MmrTable {
        &mut self.regions
    }

    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PageFlags)> {
        self.table.translate(page_round_down(va))
    }

    /// Records a new private region. Pages are faulted in lazily.
    #[must_use]
    pub fn add_region(
        &mut self,
        addr: usize,
        length: usize,
        prot: Prot,
    ) -> Result<MmrHandle, AddressSpaceError> {
        if !is_page_aligned(addr) || length == 0 || !is_page_aligned(length) || prot.is_empty() {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let end = addr
            .checked_add(length)
            .filter(|end| *end <= USER_TOP)
            .ok_or(AddressSpaceError::OutOfRange)?;
        if addr < self.size || self.regions.overlaps(addr, end) {
            return Err(AddressSpaceError::Overlap);
        }
        Ok(self.regions.insert(Mmr { addr, length, prot, family: None })?)
    }

    /// Drops a region and its translations. The caller owns the returned frames.
    pub fn remove_region(
        &mut self,
        handle: MmrHandle,
    ) -> Result<(Mmr, Vec<(usize, PhysAddr)>), AddressSpaceError> {
        let region = self.regions.remove(handle)?;
        let released = self.unmap_range(region.addr, region.end());
        Ok((region, released))
    }

    /// Removes every translation in `[start, end)` and returns what was mapped.
    pub fn unmap_range(&mut self, start: usize, end: usize) -> Vec<(usize, PhysAddr)> {
        let leaves = self.table.leaves(start, end);
        for (va, _) in &leaves {
            self.table.unmap(*va);
        }
        leaves
    }

    /// Moves the break by `delta` bytes without allocating and returns the old break.
    /// Shrinking frees every page that ends up wholly above the new break.
    #[must_use]
    pub fn sbrk(
        &mut self,
        delta: isize,
        frames: &dyn FrameAllocator,
    ) -> Result<usize, AddressSpaceError> {
        let old = self.size;
        let new = if delta >= 0 {
            old.checked_add(delta as usize)
        } else {
            old.checked_sub(delta.unsigned_abs())
        }
        .ok_or(AddressSpaceError::InvalidArgs)?;
        if new > USER_TOP {
            return Err(AddressSpaceError::OutOfRange);
        }
        if new > old && self.regions.overlaps(old, new) {
            return Err(AddressSpaceError::Overlap);
        }
        if new < old {
            for (_, pa) in self.unmap_range(page_round_up(new), page_round_up(old)) {
                frames.free(pa);
            }
        }
        self.size = new;
        Ok(old)
    }

    /// Applies a propagated installation. Installing the frame that is already present
    /// is a no-op; a different frame at the same address is an overlap. Table pages
    /// needed on the way come from `frames`.
    pub fn apply(
        &mut self,
        install: PageInstall,
        frames: &dyn FrameAllocator,
    ) -> Result<InstallOutcome, MapError> {
        match self.table.translate(install.va) {
            Some((pa, _)) if pa == install.pa => Ok(InstallOutcome::AlreadyPresent),
            Some(_) => Err(MapError::Overlap),
            None => {
                self.table.map(install.va, install.pa, install.flags, frames)?;
                Ok(InstallOutcome::Installed)
            }
        }
    }

    /// Copies `src` to user address `dst`. Stops at the first page that cannot be written.
    pub fn copy_out(&self, dst: usize, src: &[u8]) -> Result<(), CopyFault> {
        let mut done = 0;
        while done < src.len() {
            let va = dst.checked_add(done).ok_or(CopyFault::Denied(dst))?;
            let pa = self.user_page(va, PageFlags::WRITE)?;
            let offset = va % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(src.len() - done);
            // SAFETY: `pa` is a mapped user frame; physical memory is identity mapped.
            unsafe {
                core::ptr::copy_nonoverlapping(src[done..].as_ptr(), (pa + offset) as *mut u8, n);
            }
            done += n;
        }
        Ok(())
    }

    /// Fills `dst` from user address `src`.
    pub fn copy_in(&self, dst: &mut [u8], src: usize) -> Result<(), CopyFault> {
        let mut done = 0;
        while done < dst.len() {
            let va = src.checked_add(done).ok_or(CopyFault::Denied(src))?;
            let pa = self.user_page(va, PageFlags::READ)?;
            let offset = va % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            // SAFETY: see `copy_out`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (pa + offset) as *const u8,
                    dst[done..].as_mut_ptr(),
                    n,
                );
            }
            done += n;
        }
        Ok(())
    }

    /// Unmaps the break and every private region, returning their frames to `frames`
    /// together with the table pages. Family regions must have been left beforehand;
    /// any still linked are only unmapped.
    pub fn teardown(&mut self, frames: &dyn FrameAllocator) {
        let size = self.size;
        for (_, pa) in self.unmap_range(0, page_round_up(size)) {
            frames.free(pa);
        }
        let handles: Vec<MmrHandle> = self.regions.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            if let Ok((region, released)) = self.remove_region(handle) {
                if region.family.is_some() {
                    log_warn!(target: "mm", "teardown: region {:#x} still shared", region.addr);
                    continue;
                }
                for (_, pa) in released {
                    frames.free(pa);
                }
            }
        }
        let tables = self.table.release(frames);
        log_debug!(target: "mm", "teardown: released {} table pages", tables);
        self.size = 0;
    }

    fn user_page(&self, va: usize, need: PageFlags) -> Result<PhysAddr, CopyFault> {
        let page = page_round_down(va);
        if page >= USER_TOP {
            return Err(CopyFault::Denied(va));
        }
        match self.table.translate(page) {
            None => Err(CopyFault::Unmapped(va)),
            Some((pa, flags)) if flags.contains(PageFlags::USER | need) => Ok(pa),
            Some(_) => Err(CopyFault::Denied(va)),
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::test_pool;

    /// L1 and L0 table pages covering the lowest 2 MiB.
    const TABLES: usize = 2;

    #[test]
    fn regions_must_stay_clear_of_break_and_each_other() {
        let frames = test_pool(1);
        let mut space = AddressSpace::new();
        space.sbrk(4 * PAGE_SIZE as isize, &frames).unwrap();
        assert_eq!(
            space.add_region(2 * PAGE_SIZE, PAGE_SIZE, Prot::READ),
            Err(AddressSpaceError::Overlap)
        );
        let r = space.add_region(0x10_0000, 2 * PAGE_SIZE, Prot::READ).unwrap();
        assert_eq!(
            space.add_region(0x10_1000, PAGE_SIZE, Prot::READ),
            Err(AddressSpaceError::Overlap)
        );
        assert_eq!(
            space.add_region(0x10_2000, PAGE_SIZE + 1, Prot::READ),
            Err(AddressSpaceError::InvalidArgs)
        );
        assert_eq!(
            space.add_region(USER_TOP, PAGE_SIZE, Prot::READ),
            Err(AddressSpaceError::OutOfRange)
        );
        assert!(space.regions().get(r).is_some());
    }

    #[test]
    fn sbrk_is_lazy_and_bounded() {
        let frames = test_pool(2);
        let mut space = AddressSpace::new();
        assert_eq!(space.sbrk(3 * PAGE_SIZE as isize, &frames), Ok(0));
        assert_eq!(space.size(), 3 * PAGE_SIZE);
        assert_eq!(frames.free_frames(), 2);
        assert!(space.translate(0).is_none());
        assert_eq!(space.sbrk(-(4 * PAGE_SIZE as isize), &frames), Err(AddressSpaceError::InvalidArgs));
        assert_eq!(space.sbrk(USER_TOP as isize, &frames), Err(AddressSpaceError::OutOfRange));
        space.add_region(0x8000, PAGE_SIZE, Prot::READ).unwrap();
        assert_eq!(space.sbrk(0x6000, &frames), Err(AddressSpaceError::Overlap));
        assert_eq!(space.size(), 3 * PAGE_SIZE);
    }

    #[test]
    fn shrinking_frees_pages_above_the_break() {
        let frames = test_pool(3 + TABLES);
        let mut space = AddressSpace::new();
        space.sbrk(3 * PAGE_SIZE as isize, &frames).unwrap();
        for page in 0..3 {
            let pa = frames.alloc_zeroed().unwrap();
            space.page_table_mut().map(page * PAGE_SIZE, pa, BREAK_FLAGS, &frames).unwrap();
        }
        assert_eq!(frames.free_frames(), 0);
        space.sbrk(-(PAGE_SIZE as isize) - 1, &frames).unwrap();
        assert_eq!(frames.free_frames(), 1);
        assert!(space.translate(PAGE_SIZE).is_some());
        assert!(space.translate(2 * PAGE_SIZE).is_none());
    }

    #[test]
    fn apply_is_idempotent_and_refuses_conflicts() {
        let frames = test_pool(TABLES);
        let mut space = AddressSpace::new();
        let install = PageInstall { va: 0x4000, pa: 0x8000_0000, flags: Prot::READ.pte_flags() };
        assert_eq!(space.apply(install, &frames), Ok(InstallOutcome::Installed));
        assert_eq!(space.apply(install, &frames), Ok(InstallOutcome::AlreadyPresent));
        assert_eq!(space.translate(0x4000).map(|(pa, _)| pa), Some(0x8000_0000));
        let other = PageInstall { pa: 0x8000_1000, ..install };
        assert_eq!(space.apply(other, &frames), Err(MapError::Overlap));
    }

    #[test]
    fn apply_reports_exhausted_table_frames() {
        let frames = test_pool(1);
        let mut space = AddressSpace::new();
        let install = PageInstall { va: 0x4000, pa: 0x8000_0000, flags: Prot::READ.pte_flags() };
        assert_eq!(space.apply(install, &frames), Err(MapError::OutOfMemory));
        assert!(space.translate(0x4000).is_none());
        space.teardown(&frames);
        assert_eq!(frames.free_frames(), 1);
    }

    #[test]
    fn copies_cross_page_boundaries() {
        let frames = test_pool(2 + TABLES);
        let mut space = AddressSpace::new();
        space.sbrk(2 * PAGE_SIZE as isize, &frames).unwrap();
        for page in 0..2 {
            let pa = frames.alloc_zeroed().unwrap();
            space.page_table_mut().map(page * PAGE_SIZE, pa, BREAK_FLAGS, &frames).unwrap();
        }
        let data = [0x5au8; 16];
        space.copy_out(PAGE_SIZE - 8, &data).unwrap();
        let mut back = [0u8; 16];
        space.copy_in(&mut back, PAGE_SIZE - 8).unwrap();
        assert_eq!(back, data);
        assert_eq!(space.copy_out(2 * PAGE_SIZE - 4, &data), Err(CopyFault::Unmapped(2 * PAGE_SIZE)));
    }

    #[test]
    fn copy_out_respects_page_permissions() {
        let mut space = AddressSpace::new();
        let frames = test_pool(1 + TABLES);
        let pa = frames.alloc_zeroed().unwrap();
        space.page_table_mut().map(0x2000, pa, Prot::READ.pte_flags(), &frames).unwrap();
        assert_eq!(space.copy_out(0x2000, &[1]), Err(CopyFault::Denied(0x2000)));
        let mut byte = [9u8];
        space.copy_in(&mut byte, 0x2000).unwrap();
        assert_eq!(byte, [0]);
    }

    #[test]
    fn teardown_returns_private_frames() {
        let frames = test_pool(3 + TABLES);
        let mut space = AddressSpace::new();
        space.sbrk(PAGE_SIZE as isize, &frames).unwrap();
        let pa = frames.alloc_zeroed().unwrap();
        space.page_table_mut().map(0, pa, BREAK_FLAGS, &frames).unwrap();
        space.add_region(0x10_0000, PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        let pa = frames.alloc_zeroed().unwrap();
        space.page_table_mut().map(0x10_0000, pa, Prot::WRITE.pte_flags(), &frames).unwrap();
        space.teardown(&frames);
        assert_eq!(frames.free_frames(), 3 + TABLES);
        assert!(space.regions().is_empty());
        assert_eq!(space.size(), 0);
    }
}
