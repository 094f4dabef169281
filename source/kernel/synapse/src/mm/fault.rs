// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand paging for user load/store page faults
//! OWNERS: @kernel-mm-team
//! PUBLIC API: resolve(), Access, FaultError, Resolution
//! DEPENDS_ON: mm::{AddressSpace, FamilyTable, FrameAllocator}, task::Task
//! INVARIANTS: Never sleeps; a failed resolution leaves no new mapping and no leaked
//!             frame; the task's own address-space lock is released before the family
//!             lock is taken

use super::address_space::BREAK_FLAGS;
use super::family::{FamilyId, FamilyTable};
use super::frame::FrameAllocator;
use super::page_table::{MapError, PageFlags};
use super::{page_round_down, PhysAddr};
use crate::config::USER_TOP;
use crate::task::Task;

/// Direction of the faulting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
}

impl Access {
    /// Maps a load (13) or store/AMO (15) page-fault cause to an access kind.
    pub const fn from_scause(scause: usize) -> Option<Self> {
        match scause {
            13 => Some(Access::Load),
            15 => Some(Access::Store),
            _ => None,
        }
    }
}

/// Reasons a fault could not be resolved. All of them are fatal to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Address is outside the break and every region.
    InvalidAddress,
    /// The covering region does not permit the access.
    PermissionDenied,
    /// No frame was available.
    OutOfMemory,
    /// Installing the translation failed.
    Mapping(MapError),
}

impl FaultError {
    pub const fn describe(self) -> &'static str {
        match self {
            FaultError::InvalidAddress => "invalid virtual address",
            FaultError::PermissionDenied => "permission denied",
            FaultError::OutOfMemory => "out of memory",
            FaultError::Mapping(_) => "mapping failure",
        }
    }
}

impl From<MapError> for FaultError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => FaultError::OutOfMemory,
            other => FaultError::Mapping(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A translation to `pa` was installed by this call.
    Mapped { pa: PhysAddr },
    /// The page was already present (installed by a concurrent family fault).
    AlreadyMapped,
}

enum Target {
    Private(PageFlags),
    Shared(FamilyId),
}

/// Resolves a page fault of `task` at `stval`.
///
/// Pages below the break are mapped RWX on demand. Pages inside a region are mapped
/// with the region's rights after an access check; shared regions go through the
/// family so every member ends up with the same frame.
pub fn resolve(
    task: &Task,
    stval: usize,
    access: Access,
    frames: &dyn FrameAllocator,
    families: &FamilyTable,
) -> Result<Resolution, FaultError> {
    let va = page_round_down(stval);
    if va >= USER_TOP {
        return Err(FaultError::InvalidAddress);
    }

    let family = {
        let mut space = task.space().lock();
        let target = if va < space.size() {
            Target::Private(BREAK_FLAGS)
        } else {
            let (_, region) = space.regions().find(va).ok_or(FaultError::InvalidAddress)?;
            if !region.prot.allows(access) {
                return Err(FaultError::PermissionDenied);
            }
            match region.family {
                Some(id) => Target::Shared(id),
                None => Target::Private(region.prot.pte_flags()),
            }
        };
        match target {
            Target::Shared(id) => id,
            Target::Private(_) if space.translate(va).is_some() => {
                return Ok(Resolution::AlreadyMapped);
            }
            Target::Private(flags) => {
                let pa = frames.alloc_zeroed().ok_or(FaultError::OutOfMemory)?;
                if let Err(err) = space.page_table_mut().map(va, pa, flags, frames) {
                    frames.free(pa);
                    return Err(err.into());
                }
                log_trace!(target: "mm", "pid={} demand page {:#x} -> {:#x}", task.pid(), va, pa);
                return Ok(Resolution::Mapped { pa });
            }
        }
    };

    families.resolve_shared(family, task, va, frames)
}
