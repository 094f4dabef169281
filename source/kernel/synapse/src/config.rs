// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Compile-time kernel parameters
//! OWNERS: @kernel-team
//! PUBLIC API: capacity constants, address-space limits, IRQ numbers
//! INVARIANTS: Capacities fit the 16-bit index field of arena handles

use crate::mm::PAGE_SIZE;

/// Maximum number of live tasks.
pub const MAX_TASKS: usize = 64;

/// Capacity of the global semaphore table.
pub const NSEM: usize = 100;

/// Memory-mapped regions a single task may hold.
pub const MAX_MMR: usize = 10;

/// Capacity of the family table (every task may share every region).
pub const MAX_FAMILIES: usize = MAX_TASKS * MAX_MMR;

/// One past the highest Sv39 user virtual address.
pub const MAXVA: usize = 1 << 38;

/// Top of the trampoline/trapframe pages; user break and regions stay below.
pub const USER_TOP: usize = MAXVA - 2 * PAGE_SIZE;

/// `pshared` value selecting semaphores shared between processes.
pub const PSHARED_PROCESS: i32 = 1;

/// Hart that owns the global tick counter.
pub const TIMEKEEPER_HART: usize = 0;

/// QEMU `virt` PLIC source for UART0.
pub const UART0_IRQ: u32 = 10;

/// QEMU `virt` PLIC source for the first virtio-mmio device.
pub const VIRTIO0_IRQ: u32 = 1;

/// Maximum number of registered device interrupt handlers.
pub const MAX_IRQ_HANDLERS: usize = 8;

static_assertions::const_assert!(NSEM <= u16::MAX as usize);
static_assertions::const_assert!(MAX_MMR <= u16::MAX as usize);
static_assertions::const_assert!(MAX_FAMILIES <= u16::MAX as usize);
static_assertions::const_assert!(USER_TOP % PAGE_SIZE == 0);
