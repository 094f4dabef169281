// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-task sharing groups for memory-mapped regions
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + fault scenarios (mm::fault)
//! PUBLIC API: FamilyTable (create/join/leave/resolve_shared), FamilyId, FamilyError
//! DEPENDS_ON: task::Task, mm::AddressSpace (PageInstall), mm::frame
//! INVARIANTS: Every member region has the family's addr/length; every page present in
//!             one member is present, with the same frame, in all members once the
//!             family lock is released; lock order is family lock, then address space;
//!             the table lock is never held while taking a family lock

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex;

use super::address_space::{InstallOutcome, PageInstall};
use super::fault::{FaultError, Resolution};
use super::frame::FrameAllocator;
use super::mmr::MmrHandle;
use super::page_table::MapError;
use super::PhysAddr;
use crate::arena::{Arena, Handle};
use crate::config::MAX_FAMILIES;
use crate::task::Task;

/// Generation-tagged family identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FamilyId(Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyError {
    /// Family table is full.
    TableFull,
    /// Identifier is stale or the family has dissolved.
    NoSuchFamily,
    /// Region handle does not name a live region of the task.
    NoSuchRegion,
    /// Region is already part of a family.
    AlreadyShared,
    /// Region geometry differs from the family's.
    Mismatch,
    /// Task/region pair is not a member.
    NotMember,
    /// Installing the family's pages failed.
    Mapping(MapError),
}

struct Member {
    task: Arc<Task>,
    region: MmrHandle,
}

impl Member {
    fn is(&self, task: &Task, region: MmrHandle) -> bool {
        self.task.pid() == task.pid() && self.region == region
    }

    fn translate(&self, va: usize) -> Option<PhysAddr> {
        self.task.space().lock().page_table().translate(va).map(|(pa, _)| pa)
    }
}

struct Family {
    addr: usize,
    length: usize,
    members: Vec<Member>,
    dead: bool,
}

type FamilyRef = Arc<Mutex<Family>>;

/// Registry of live families.
pub struct FamilyTable {
    families: Mutex<Arena<FamilyRef, MAX_FAMILIES>>,
}

impl FamilyTable {
    pub fn new() -> Self {
        Self { families: Mutex::new(Arena::new()) }
    }

    /// Number of live families.
    pub fn len(&self) -> usize {
        self.families.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of members in `id`, if it is live.
    pub fn members(&self, id: FamilyId) -> Option<usize> {
        let family = self.lookup(id).ok()?;
        let family = family.lock();
        (!family.dead).then_some(family.members.len())
    }

    /// Starts a family whose sole member is `region` of `task`. Pages already
    /// present in the region become family pages.
    pub fn create(&self, task: &Arc<Task>, region: MmrHandle) -> Result<FamilyId, FamilyError> {
        let (addr, length) = {
            let space = task.space().lock();
            let mmr = space.regions().get(region).ok_or(FamilyError::NoSuchRegion)?;
            if mmr.family.is_some() {
                return Err(FamilyError::AlreadyShared);
            }
            (mmr.addr, mmr.length)
        };
        let family = Arc::new(Mutex::new(Family {
            addr,
            length,
            members: vec![Member { task: Arc::clone(task), region }],
            dead: false,
        }));
        let id = FamilyId(
            self.families.lock().insert(Arc::clone(&family)).map_err(|_| FamilyError::TableFull)?,
        );

        let linked = {
            let _family = family.lock();
            let mut space = task.space().lock();
            match space.regions_mut().get_mut(region) {
                Some(mmr) if mmr.family.is_none() => {
                    mmr.family = Some(id);
                    true
                }
                _ => false,
            }
        };
        if !linked {
            family.lock().dead = true;
            self.families.lock().remove(id.0);
            return Err(FamilyError::AlreadyShared);
        }
        log_debug!(target: "mm", "family {:?} created pid={} addr={:#x} len={:#x}", id, task.pid(), addr, length);
        Ok(id)
    }

    /// Adds `region` of `task` to family `id` and installs every page the family
    /// already has, before returning. Table pages for the installs come from `frames`.
    pub fn join(
        &self,
        id: FamilyId,
        task: &Arc<Task>,
        region: MmrHandle,
        frames: &dyn FrameAllocator,
    ) -> Result<(), FamilyError> {
        let family = self.lookup(id)?;
        let mut family = family.lock();
        if family.dead {
            return Err(FamilyError::NoSuchFamily);
        }
        if family.members.iter().any(|member| member.is(task, region)) {
            return Err(FamilyError::AlreadyShared);
        }
        let (addr, end) = (family.addr, family.addr + family.length);
        let present = match family.members.first() {
            Some(member) => member.task.space().lock().page_table().leaves(addr, end),
            None => Vec::new(),
        };

        {
            let mut space = task.space().lock();
            let mmr = *space.regions().get(region).ok_or(FamilyError::NoSuchRegion)?;
            if mmr.family.is_some() {
                return Err(FamilyError::AlreadyShared);
            }
            if mmr.addr != family.addr || mmr.length != family.length {
                return Err(FamilyError::Mismatch);
            }
            let flags = mmr.prot.pte_flags();
            let mut installed = Vec::new();
            for (va, pa) in present {
                match space.apply(PageInstall { va, pa, flags }, frames) {
                    Ok(InstallOutcome::Installed) => installed.push(va),
                    Ok(InstallOutcome::AlreadyPresent) => {}
                    Err(err) => {
                        for va in installed {
                            space.page_table_mut().unmap(va);
                        }
                        return Err(FamilyError::Mapping(err));
                    }
                }
            }
            if let Some(mmr) = space.regions_mut().get_mut(region) {
                mmr.family = Some(id);
            }
        }
        family.members.push(Member { task: Arc::clone(task), region });
        log_debug!(target: "mm", "family {:?} joined pid={} members={}", id, task.pid(), family.members.len());
        Ok(())
    }

    /// Removes `region` of `task` from family `id` and unmaps it from the task. A
    /// frame is freed only when no remaining member maps it; the last member
    /// dissolves the family.
    pub fn leave(
        &self,
        id: FamilyId,
        task: &Task,
        region: MmrHandle,
        frames: &dyn FrameAllocator,
    ) -> Result<(), FamilyError> {
        let family_ref = self.lookup(id)?;
        let mut family = family_ref.lock();
        let position = family
            .members
            .iter()
            .position(|member| member.is(task, region))
            .ok_or(FamilyError::NotMember)?;
        family.members.remove(position);

        let released = {
            let mut space = task.space().lock();
            if let Some(mmr) = space.regions_mut().get_mut(region) {
                mmr.family = None;
            }
            space.unmap_range(family.addr, family.addr + family.length)
        };
        for (va, pa) in released {
            let still_shared = family.members.iter().any(|member| member.translate(va) == Some(pa));
            if !still_shared {
                frames.free(pa);
            }
        }

        let dissolved = family.members.is_empty();
        if dissolved {
            family.dead = true;
        }
        drop(family);
        if dissolved {
            self.families.lock().remove(id.0);
            log_debug!(target: "mm", "family {:?} dissolved", id);
        }
        Ok(())
    }

    /// Resolves a fault at page `va` of a shared region: reuses the frame any member
    /// already maps, or allocates one, then installs it in the faulting task first and
    /// in every other member after. On failure the installs made here are rolled back
    /// and a frame allocated here is freed.
    pub fn resolve_shared(
        &self,
        id: FamilyId,
        task: &Task,
        va: usize,
        frames: &dyn FrameAllocator,
    ) -> Result<Resolution, FaultError> {
        let family = self.lookup(id).map_err(|_| FaultError::InvalidAddress)?;
        let family = family.lock();
        if family.dead {
            return Err(FaultError::InvalidAddress);
        }
        let Some(me) = family.members.iter().position(|member| member.task.pid() == task.pid())
        else {
            log_warn!(target: "mm", "pid={} faulted on family {:?} it does not belong to", task.pid(), id);
            return Err(FaultError::InvalidAddress);
        };

        let existing = family.members.iter().find_map(|member| member.translate(va));
        let fresh = existing.is_none();
        let pa = match existing {
            Some(pa) => pa,
            None => frames.alloc_zeroed().ok_or(FaultError::OutOfMemory)?,
        };

        let order = core::iter::once(me).chain((0..family.members.len()).filter(|&i| i != me));
        let mut installed: Vec<usize> = Vec::new();
        for index in order {
            let member = &family.members[index];
            let outcome = {
                let mut space = member.task.space().lock();
                match space.regions().get(member.region) {
                    Some(mmr) => {
                        let flags = mmr.prot.pte_flags();
                        space.apply(PageInstall { va, pa, flags }, frames)
                    }
                    None => Err(MapError::OutOfRange),
                }
            };
            match outcome {
                Ok(InstallOutcome::Installed) => installed.push(index),
                Ok(InstallOutcome::AlreadyPresent) => {}
                Err(err) => {
                    for &undo in &installed {
                        family.members[undo].task.space().lock().page_table_mut().unmap(va);
                    }
                    if fresh {
                        frames.free(pa);
                    }
                    log_warn!(
                        target: "mm",
                        "family {:?} install into pid={} failed: {:?}",
                        id,
                        member.task.pid(),
                        err
                    );
                    return Err(err.into());
                }
            }
        }

        if installed.is_empty() {
            Ok(Resolution::AlreadyMapped)
        } else {
            Ok(Resolution::Mapped { pa })
        }
    }

    fn lookup(&self, id: FamilyId) -> Result<FamilyRef, FamilyError> {
        self.families.lock().get(id.0).cloned().ok_or(FamilyError::NoSuchFamily)
    }
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::test_pool;
    use crate::mm::{Prot, PAGE_SIZE};
    use crate::task::TaskTable;

    const BASE: usize = 0x20_0000;
    /// Table pages each task needs before its first mapping at `BASE`.
    const TABLES: usize = 2;

    fn task_with_region(tasks: &TaskTable, pages: usize, prot: Prot) -> (Arc<Task>, MmrHandle) {
        let task = tasks.spawn(None).unwrap();
        let region = task.space().lock().add_region(BASE, pages * PAGE_SIZE, prot).unwrap();
        (task, region)
    }

    #[test]
    fn join_installs_existing_pages() {
        let tasks = TaskTable::new();
        let frames = test_pool(1 + 2 * TABLES);
        let (p, rp) = task_with_region(&tasks, 2, Prot::READ | Prot::WRITE);
        let (q, rq) = task_with_region(&tasks, 2, Prot::READ);
        let (families, id) = tables_create(&p, rp);
        families.resolve_shared(id, &p, BASE + PAGE_SIZE, &frames).unwrap();
        families.join(id, &q, rq, &frames).unwrap();
        assert_eq!(frames.free_frames(), 0);
        let pp = p.space().lock().translate(BASE + PAGE_SIZE).unwrap();
        let qq = q.space().lock().translate(BASE + PAGE_SIZE).unwrap();
        assert_eq!(pp.0, qq.0);
        assert!(!qq.1.contains(crate::mm::PageFlags::WRITE));
        assert_eq!(families.members(id), Some(2));
    }

    fn tables_create(task: &Arc<Task>, region: MmrHandle) -> (FamilyTable, FamilyId) {
        let families = FamilyTable::new();
        let id = families.create(task, region).unwrap();
        (families, id)
    }

    #[test]
    fn join_rejects_mismatched_geometry() {
        let tasks = TaskTable::new();
        let (p, rp) = task_with_region(&tasks, 2, Prot::READ);
        let (q, rq) = task_with_region(&tasks, 1, Prot::READ);
        let frames = test_pool(1);
        let (families, id) = tables_create(&p, rp);
        assert_eq!(families.join(id, &q, rq, &frames), Err(FamilyError::Mismatch));
        assert_eq!(families.create(&p, rp), Err(FamilyError::AlreadyShared));
    }

    #[test]
    fn leave_frees_frames_only_for_last_member() {
        let tasks = TaskTable::new();
        let frames = test_pool(2 + 2 * TABLES);
        let (p, rp) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (q, rq) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (families, id) = tables_create(&p, rp);
        families.join(id, &q, rq, &frames).unwrap();
        families.resolve_shared(id, &q, BASE, &frames).unwrap();
        assert_eq!(frames.free_frames(), 1);

        families.leave(id, &p, rp, &frames).unwrap();
        assert_eq!(frames.free_frames(), 1);
        assert!(p.space().lock().translate(BASE).is_none());
        assert!(q.space().lock().translate(BASE).is_some());
        assert_eq!(p.space().lock().regions().get(rp).and_then(|m| m.family), None);

        families.leave(id, &q, rq, &frames).unwrap();
        assert_eq!(frames.free_frames(), 2);
        assert!(families.is_empty());
        assert_eq!(families.join(id, &p, rp, &frames), Err(FamilyError::NoSuchFamily));
        assert_eq!(families.leave(id, &q, rq, &frames), Err(FamilyError::NoSuchFamily));
    }

    #[test]
    fn propagation_is_idempotent() {
        let tasks = TaskTable::new();
        let frames = test_pool(2 + 2 * TABLES);
        let (p, rp) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (q, rq) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (families, id) = tables_create(&p, rp);
        families.join(id, &q, rq, &frames).unwrap();
        let first = families.resolve_shared(id, &p, BASE, &frames).unwrap();
        let Resolution::Mapped { pa } = first else { panic!("expected a fresh mapping") };
        assert_eq!(families.resolve_shared(id, &p, BASE, &frames), Ok(Resolution::AlreadyMapped));
        assert_eq!(families.resolve_shared(id, &q, BASE, &frames), Ok(Resolution::AlreadyMapped));
        assert_eq!(frames.free_frames(), 1);
        for task in [&p, &q] {
            assert_eq!(task.space().lock().translate(BASE).map(|(pa, _)| pa), Some(pa));
        }
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failed_install_rolls_back_every_member() {
        let tasks = TaskTable::new();
        let frames = test_pool(2 + 2 * TABLES);
        let (p, rp) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (q, rq) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (families, id) = tables_create(&p, rp);
        families.join(id, &q, rq, &frames).unwrap();
        q.space().lock().page_table_mut().deny_next_map();
        assert_eq!(
            families.resolve_shared(id, &p, BASE, &frames),
            Err(FaultError::Mapping(MapError::PermissionDenied))
        );
        assert!(p.space().lock().translate(BASE).is_none());
        assert!(q.space().lock().translate(BASE).is_none());
        // P keeps the table pages it grew until teardown.
        assert_eq!(frames.free_frames(), 2 + TABLES);
    }

    #[test]
    fn table_exhaustion_in_a_partner_rolls_back() {
        let tasks = TaskTable::new();
        // Data frame and P's tables fit; Q's first table page does not.
        let frames = test_pool(1 + TABLES);
        let (p, rp) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (q, rq) = task_with_region(&tasks, 1, Prot::READ | Prot::WRITE);
        let (families, id) = tables_create(&p, rp);
        families.join(id, &q, rq, &frames).unwrap();
        assert_eq!(families.resolve_shared(id, &p, BASE, &frames), Err(FaultError::OutOfMemory));
        assert!(p.space().lock().translate(BASE).is_none());
        assert!(q.space().lock().translate(BASE).is_none());
        assert_eq!(frames.free_frames(), 1);

        p.space().lock().teardown(&frames);
        assert_eq!(frames.free_frames(), 1 + TABLES);
    }

    #[test]
    fn join_without_table_frames_leaves_the_region_private() {
        let tasks = TaskTable::new();
        let frames = test_pool(2 + TABLES);
        let (p, rp) = task_with_region(&tasks, 2, Prot::READ | Prot::WRITE);
        let (q, rq) = task_with_region(&tasks, 2, Prot::READ | Prot::WRITE);
        let (families, id) = tables_create(&p, rp);
        families.resolve_shared(id, &p, BASE, &frames).unwrap();
        families.resolve_shared(id, &p, BASE + PAGE_SIZE, &frames).unwrap();
        assert_eq!(frames.free_frames(), 0);

        assert_eq!(
            families.join(id, &q, rq, &frames),
            Err(FamilyError::Mapping(MapError::OutOfMemory))
        );
        assert!(q.space().lock().translate(BASE).is_none());
        assert_eq!(q.space().lock().regions().get(rq).and_then(|m| m.family), None);
        assert_eq!(families.members(id), Some(1));
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn allocation_failure_maps_nothing() {
        let tasks = TaskTable::new();
        let frames = test_pool(1);
        let (p, rp) = task_with_region(&tasks, 1, Prot::READ);
        let (families, id) = tables_create(&p, rp);
        frames.fail_next_alloc();
        assert_eq!(families.resolve_shared(id, &p, BASE, &frames), Err(FaultError::OutOfMemory));
        assert!(p.space().lock().translate(BASE).is_none());
    }
}
