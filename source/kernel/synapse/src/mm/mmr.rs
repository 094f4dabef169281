// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-task table of memory-mapped regions.

use bitflags::bitflags;

use super::fault::Access;
use super::family::FamilyId;
use super::page_table::PageFlags;
use crate::arena::{Arena, Handle};
use crate::config::MAX_MMR;

bitflags! {
    /// Access rights granted by a region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    /// Reports whether a faulting access of kind `access` is permitted.
    pub fn allows(self, access: Access) -> bool {
        match access {
            Access::Load => self.contains(Prot::READ),
            Access::Store => self.contains(Prot::WRITE),
        }
    }

    /// Leaf flags for a user page with these rights. Writable pages are also
    /// readable because Sv39 has no write-only encoding.
    pub fn pte_flags(self) -> PageFlags {
        let mut flags = PageFlags::VALID | PageFlags::USER;
        if self.intersects(Prot::READ | Prot::WRITE) {
            flags |= PageFlags::READ;
        }
        if self.contains(Prot::WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.contains(Prot::EXEC) {
            flags |= PageFlags::EXECUTE;
        }
        flags
    }
}

/// Handle naming a region inside one task's table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MmrHandle(Handle);

/// A mapped region `[addr, addr + length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mmr {
    pub addr: usize,
    pub length: usize,
    pub prot: Prot,
    pub family: Option<FamilyId>,
}

impl Mmr {
    pub fn end(&self) -> usize {
        self.addr + self.length
    }

    /// Half-open containment test.
    pub fn contains(&self, va: usize) -> bool {
        va >= self.addr && va - self.addr < self.length
    }

    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.addr < end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmrError {
    /// All `MAX_MMR` slots are taken.
    TableFull,
    /// Handle does not name a live region.
    NoSuchRegion,
}

/// Fixed-capacity region list.
pub struct MmrTable {
    regions: Arena<Mmr, MAX_MMR>,
}

impl MmrTable {
    pub fn new() -> Self {
        Self { regions: Arena::new() }
    }

    pub fn insert(&mut self, region: Mmr) -> Result<MmrHandle, MmrError> {
        self.regions.insert(region).map(MmrHandle).map_err(|_| MmrError::TableFull)
    }

    pub fn remove(&mut self, handle: MmrHandle) -> Result<Mmr, MmrError> {
        self.regions.remove(handle.0).ok_or(MmrError::NoSuchRegion)
    }

    pub fn get(&self, handle: MmrHandle) -> Option<&Mmr> {
        self.regions.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: MmrHandle) -> Option<&mut Mmr> {
        self.regions.get_mut(handle.0)
    }

    /// Finds the region containing `va`.
    pub fn find(&self, va: usize) -> Option<(MmrHandle, &Mmr)> {
        self.iter().find(|(_, region)| region.contains(va))
    }

    /// Reports whether any region intersects `[start, end)`.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.iter().any(|(_, region)| region.overlaps(start, end))
    }

    pub fn iter(&self) -> impl Iterator<Item = (MmrHandle, &Mmr)> + '_ {
        self.regions.iter().map(|(handle, region)| (MmrHandle(handle), region))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Default for MmrTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;
    use proptest::prelude::*;

    fn region(addr: usize, pages: usize, prot: Prot) -> Mmr {
        Mmr { addr, length: pages * PAGE_SIZE, prot, family: None }
    }

    #[test]
    fn containment_is_half_open() {
        let r = region(0x10000, 2, Prot::READ);
        assert!(r.contains(0x10000));
        assert!(r.contains(0x11fff));
        assert!(!r.contains(0x12000));
        assert!(!r.contains(0xffff));
    }

    #[test]
    fn find_picks_the_covering_region() {
        let mut table = MmrTable::new();
        let a = table.insert(region(0x10000, 1, Prot::READ)).unwrap();
        let b = table.insert(region(0x20000, 3, Prot::WRITE)).unwrap();
        assert_eq!(table.find(0x10800).map(|(h, _)| h), Some(a));
        assert_eq!(table.find(0x22fff).map(|(h, _)| h), Some(b));
        assert!(table.find(0x23000).is_none());
        assert!(table.find(0x11000).is_none());
    }

    #[test]
    fn table_is_bounded() {
        let mut table = MmrTable::new();
        for i in 0..MAX_MMR {
            table.insert(region(0x10000 * (i + 1), 1, Prot::READ)).unwrap();
        }
        assert_eq!(table.insert(region(0x1000_0000, 1, Prot::READ)), Err(MmrError::TableFull));
    }

    #[test]
    fn removed_handle_goes_stale() {
        let mut table = MmrTable::new();
        let h = table.insert(region(0x10000, 1, Prot::READ)).unwrap();
        table.remove(h).unwrap();
        assert_eq!(table.remove(h), Err(MmrError::NoSuchRegion));
        assert!(table.get(h).is_none());
    }

    #[test]
    fn write_only_maps_readable() {
        let flags = Prot::WRITE.pte_flags();
        assert!(flags.contains(PageFlags::READ | PageFlags::WRITE | PageFlags::USER));
        assert!(!Prot::WRITE.allows(Access::Load));
        assert!(Prot::WRITE.allows(Access::Store));
        assert!(!Prot::EXEC.pte_flags().contains(PageFlags::READ));
    }

    proptest! {
        #[test]
        fn find_agrees_with_linear_scan(pages in proptest::collection::vec(1usize..4, 1..MAX_MMR), probe in 0usize..0x80) {
            let mut table = MmrTable::new();
            let mut regions = alloc::vec::Vec::new();
            let mut cursor = 0x10 * PAGE_SIZE;
            for len in pages {
                let r = region(cursor, len, Prot::READ);
                table.insert(r).unwrap();
                regions.push(r);
                cursor += (len + 1) * PAGE_SIZE;
            }
            let va = probe * PAGE_SIZE;
            let expected = regions.iter().find(|r| va >= r.addr && va < r.addr + r.length).copied();
            prop_assert_eq!(table.find(va).map(|(_, r)| *r), expected);
        }
    }
}
