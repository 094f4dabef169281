// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel aggregate and boot-time bring-up
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (memory-manager entry points, user copies, exit), kmain() on the target
//! DEPENDS_ON: mm, sem, task, time, hal, syscall
//! INVARIANTS: Shared regions leave their family before the owner's address space is torn
//!             down; user copies fault pages in through the resolver and never kill the caller

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::hal::DeviceTable;
use crate::mm::{
    fault, Access, AddressSpaceError, CopyError, CopyFault, FamilyError, FamilyId, FamilyTable,
    FaultError, FrameAllocator, MmrHandle, Prot, Resolution,
};
use crate::sem::SemaphoreTable;
use crate::syscall::{api, Args, SysResult, SyscallTable};
use crate::task::{Task, TaskError, TaskTable};
use crate::time::TickClock;

/// Every kernel subsystem, shared by all harts.
pub struct Kernel {
    frames: Box<dyn FrameAllocator>,
    tasks: TaskTable,
    families: FamilyTable,
    semaphores: SemaphoreTable,
    clock: TickClock,
    devices: DeviceTable,
    syscalls: SyscallTable,
}

impl Kernel {
    pub fn new(frames: impl FrameAllocator + 'static) -> Self {
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        Self {
            frames: Box::new(frames),
            tasks: TaskTable::new(),
            families: FamilyTable::new(),
            semaphores: SemaphoreTable::new(),
            clock: TickClock::new(),
            devices: DeviceTable::new(),
            syscalls,
        }
    }

    pub fn frames(&self) -> &dyn FrameAllocator {
        &*self.frames
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn families(&self) -> &FamilyTable {
        &self.families
    }

    pub fn semaphores(&self) -> &SemaphoreTable {
        &self.semaphores
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn spawn(&self, parent: Option<u32>) -> Result<Arc<Task>, TaskError> {
        self.tasks.spawn(parent)
    }

    /// Adds a lazily populated region to `task`.
    pub fn map_region(
        &self,
        task: &Task,
        addr: usize,
        length: usize,
        prot: Prot,
    ) -> Result<MmrHandle, AddressSpaceError> {
        task.space().lock().add_region(addr, length, prot)
    }

    /// Shares `region` of `task`: starts a new family, or joins `family` when given.
    pub fn share_region(
        &self,
        task: &Arc<Task>,
        region: MmrHandle,
        family: Option<FamilyId>,
    ) -> Result<FamilyId, FamilyError> {
        match family {
            Some(id) => self.families.join(id, task, region, self.frames()).map(|()| id),
            None => self.families.create(task, region),
        }
    }

    /// Removes `region` from `task`, leaving its family first. If the region cannot
    /// leave, nothing is unmapped or freed and the region stays in place.
    pub fn unmap_region(&self, task: &Task, region: MmrHandle) -> Result<(), AddressSpaceError> {
        let family = task
            .space()
            .lock()
            .regions()
            .get(region)
            .ok_or(AddressSpaceError::NoSuchRegion)?
            .family;
        if let Some(id) = family {
            self.families.leave(id, task, region, self.frames()).map_err(|err| {
                log_warn!(target: "mm", "pid={} leave {:?} failed: {:?}", task.pid(), id, err);
                AddressSpaceError::from(err)
            })?;
        }
        let (_, released) = task.space().lock().remove_region(region)?;
        for (_, pa) in released {
            self.frames.free(pa);
        }
        Ok(())
    }

    pub fn resolve_fault(
        &self,
        task: &Task,
        stval: usize,
        access: Access,
    ) -> Result<Resolution, FaultError> {
        fault::resolve(task, stval, access, self.frames(), &self.families)
    }

    /// Copies `src` into user memory of `task`, demand-faulting pages as needed.
    pub fn copy_out(&self, task: &Task, dst: usize, src: &[u8]) -> Result<(), CopyError> {
        loop {
            let result = task.space().lock().copy_out(dst, src);
            match result {
                Ok(()) => return Ok(()),
                Err(fault) => self.fault_for_copy(task, fault, Access::Store)?,
            }
        }
    }

    /// Copies user memory of `task` into `dst`, demand-faulting pages as needed.
    pub fn copy_in(&self, task: &Task, dst: &mut [u8], src: usize) -> Result<(), CopyError> {
        loop {
            let result = task.space().lock().copy_in(dst, src);
            match result {
                Ok(()) => return Ok(()),
                Err(fault) => self.fault_for_copy(task, fault, Access::Load)?,
            }
        }
    }

    fn fault_for_copy(&self, task: &Task, fault: CopyFault, access: Access) -> Result<(), CopyError> {
        match fault {
            CopyFault::Denied(va) => Err(CopyError::BadAddress(va)),
            CopyFault::Unmapped(va) => match self.resolve_fault(task, va, access) {
                Ok(_) => Ok(()),
                Err(err) => Err(CopyError::Fault(err)),
            },
        }
    }

    /// Runs syscall `number` for `task`.
    pub fn syscall(&self, task: &Arc<Task>, number: usize, args: &Args) -> SysResult<usize> {
        let mut ctx = api::Context::new(self, task);
        self.syscalls.dispatch(number, &mut ctx, args)
    }

    /// Releases everything `task` owns and drops it from the task table.
    pub fn exit_task(&self, task: &Task, code: i32) {
        let shared: Vec<(MmrHandle, FamilyId)> = task
            .space()
            .lock()
            .regions()
            .iter()
            .filter_map(|(handle, region)| region.family.map(|id| (handle, id)))
            .collect();
        for (region, id) in shared {
            if let Err(err) = self.families.leave(id, task, region, self.frames()) {
                log_warn!(target: "task", "pid={} leave {:?} on exit: {:?}", task.pid(), id, err);
            }
        }
        task.space().lock().teardown(self.frames());
        task.set_zombie(code);
        self.tasks.remove(task.pid());
        log_info!(target: "task", "pid={} exited status={}", task.pid(), code);
    }
}

static_assertions::assert_impl_all!(Kernel: Send, Sync);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod image {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::NonNull;

    use linked_list_allocator::Heap;
    use spin::{Mutex, Once};

    use super::Kernel;
    use crate::arch::riscv as arch;
    use crate::config::UART0_IRQ;
    use crate::hal::virt::VirtPlatform;
    use crate::mm::FramePool;

    const HEAP_SIZE: usize = 1024 * 1024;
    /// End of RAM on QEMU `virt` with 128 MiB.
    const PHYSTOP: usize = 0x8000_0000 + 128 * 1024 * 1024;

    struct KernelHeap(Mutex<Heap>);

    // SAFETY: every access goes through the heap mutex.
    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.0
                .lock()
                .allocate_first_fit(layout)
                .map_or(core::ptr::null_mut(), |block| block.as_ptr())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(block) = NonNull::new(ptr) {
                // SAFETY: `ptr` came from `alloc` with the same layout.
                unsafe { self.0.lock().deallocate(block, layout) };
            }
        }
    }

    #[global_allocator]
    static HEAP: KernelHeap = KernelHeap(Mutex::new(Heap::empty()));
    static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];
    static KERNEL: Once<Kernel> = Once::new();

    extern "C" {
        static __kernel_end: u8;
    }

    fn uart_irq(_irq: u32) {
        while let Some(_byte) = crate::uart::poll_byte() {
            #[cfg(feature = "debug_uart")]
            log_debug!(target: "uart", "rx {:#04x}", _byte);
        }
    }

    /// Shared kernel instance; available once `kmain` has run.
    pub fn kernel() -> Option<&'static Kernel> {
        KERNEL.get()
    }

    /// Boot-hart entry: heap, frame pool, devices, interrupts; then idles.
    pub fn kmain() -> ! {
        // SAFETY: single hart, before any allocation; `HEAP_SPACE` is handed over for good.
        unsafe {
            HEAP.0.lock().init(core::ptr::addr_of_mut!(HEAP_SPACE).cast::<u8>(), HEAP_SIZE);
        }
        // SAFETY: `__kernel_end` is placed by the linker after every loaded section.
        let start = unsafe { &__kernel_end as *const u8 as usize };
        // SAFETY: [kernel end, PHYSTOP) is unused RAM, identity mapped.
        let frames = unsafe { FramePool::from_range(start, PHYSTOP) };
        let kernel = KERNEL.call_once(|| Kernel::new(frames));
        if let Err(err) = kernel.devices().register(UART0_IRQ, uart_irq) {
            log_warn!(target: "boot", "uart irq registration failed: {:?}", err);
        }
        let platform = VirtPlatform;
        // SAFETY: boot hart, once, before interrupts are enabled.
        unsafe {
            crate::trap::install_kernel_vector();
            VirtPlatform::init_plic();
            platform.init_hart();
        }
        log_info!(
            target: "boot",
            "synapse up: free frames={} sems={}",
            kernel.frames().free_frames(),
            kernel.semaphores().capacity()
        );
        loop {
            arch::wait_for_interrupt();
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use image::{kernel, kmain};
