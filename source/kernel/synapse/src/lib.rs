// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SYNAPSE kernel core: demand paging, shared memory families, semaphores
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit and property tests on the host
//! PUBLIC API: kmain::Kernel, trap::{user_trap, kernel_trap}, kmain() on the target
//! DEPENDS_ON: spin, bitflags, riscv, sbi-rt, linked_list_allocator
//! INVARIANTS: Host builds compile everything except MMIO, CSR and boot code

#![no_std]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub mod log;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod uart;

pub mod arch;
pub mod arena;
pub mod config;
pub mod hal;
pub mod kmain;
pub mod mm;
#[cfg(all(target_arch = "riscv64", target_os = "none", feature = "panic_handler"))]
mod panic;
pub mod sem;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod time;
pub mod trap;

pub use kmain::Kernel;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use kmain::kmain;
