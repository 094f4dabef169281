// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management: frames, Sv39 tables, regions, families, demand paging
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PAGE_SIZE, PhysAddr, page_round_down/up, submodules
//! DEPENDS_ON: bitflags, spin::Mutex, arena
//! INVARIANTS: User break [0, size) and every region are disjoint; cross-task page-table
//!             writes happen only through PageInstall under a family lock

pub mod address_space;
pub mod family;
pub mod fault;
pub mod frame;
pub mod mmr;
pub mod page_table;

pub use address_space::{
    AddressSpace, AddressSpaceError, CopyError, CopyFault, InstallOutcome, PageInstall,
};
pub use family::{FamilyError, FamilyId, FamilyTable};
pub use fault::{Access, FaultError, Resolution};
pub use frame::{FrameAllocator, FramePool, Page};
pub use mmr::{Mmr, MmrError, MmrHandle, MmrTable, Prot};
pub use page_table::{MapError, PageFlags, PageTable};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Physical address of a frame. The kernel maps physical memory one-to-one.
pub type PhysAddr = usize;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds up to the next page boundary; saturates at the last page.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(value) => value & !(PAGE_SIZE - 1),
        None => usize::MAX & !(PAGE_SIZE - 1),
    }
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}
