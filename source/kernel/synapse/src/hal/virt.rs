// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use core::ptr::{read_volatile, write_volatile};

use ::riscv::register::{sie, sstatus};

use super::Platform;
use crate::arch::riscv as arch;
use crate::config::{UART0_IRQ, VIRTIO0_IRQ};

const PLIC_BASE: usize = 0x0c00_0000;
const PLIC_SENABLE: usize = PLIC_BASE + 0x2080;
const PLIC_SPRIORITY: usize = PLIC_BASE + 0x20_1000;
const PLIC_SCLAIM: usize = PLIC_BASE + 0x20_1004;
const PLIC_HART_STRIDE: usize = 0x2000;
const PLIC_ENABLE_STRIDE: usize = 0x100;

/// Timer interval in `time` CSR ticks (about 100 ms on QEMU's 10 MHz clock).
pub const TICK_INTERVAL: u64 = 1_000_000;

/// Platform operations for the hart executing the call.
pub struct VirtPlatform;

impl VirtPlatform {
    /// Gives the UART and first virtio device a non-zero PLIC priority.
    ///
    /// # Safety
    /// Must run once during boot with the PLIC identity mapped.
    pub unsafe fn init_plic() {
        for irq in [UART0_IRQ, VIRTIO0_IRQ] {
            // SAFETY: priority registers are 32-bit words indexed by source.
            unsafe { write_volatile((PLIC_BASE + irq as usize * 4) as *mut u32, 1) };
        }
    }

    /// Enables the PLIC sources for this hart, zeroes its threshold and turns on
    /// supervisor external, software and (with `timer_irq`) timer interrupts.
    ///
    /// # Safety
    /// Must run once per hart after the trap vector is installed.
    pub unsafe fn init_hart(&self) {
        let hart = self.hart_id();
        let enable = (1u32 << UART0_IRQ) | (1u32 << VIRTIO0_IRQ);
        // SAFETY: per-hart PLIC context registers.
        unsafe {
            write_volatile((PLIC_SENABLE + hart * PLIC_ENABLE_STRIDE) as *mut u32, enable);
            write_volatile((PLIC_SPRIORITY + hart * PLIC_HART_STRIDE) as *mut u32, 0);
            sie::set_sext();
            sie::set_ssoft();
            #[cfg(feature = "timer_irq")]
            sie::set_stimer();
        }
        #[cfg(feature = "timer_irq")]
        self.rearm_timer();
    }
}

impl Platform for VirtPlatform {
    fn hart_id(&self) -> usize {
        // The boot path keeps the hart id in `tp`.
        let id: usize;
        // SAFETY: reading a general-purpose register has no side effects.
        unsafe { core::arch::asm!("mv {0}, tp", out(reg) id, options(nomem, nostack, preserves_flags)) };
        id
    }

    fn intr_on(&self) {
        // SAFETY: enabling SIE is sound once the trap vector is installed.
        unsafe { sstatus::set_sie() };
    }

    fn intr_enabled(&self) -> bool {
        sstatus::read().sie()
    }

    fn claim_irq(&self) -> Option<u32> {
        let claim = (PLIC_SCLAIM + self.hart_id() * PLIC_HART_STRIDE) as *const u32;
        // SAFETY: the claim register is identity mapped and readable from S-mode.
        match unsafe { read_volatile(claim) } {
            0 => None,
            irq => Some(irq),
        }
    }

    fn complete_irq(&self, irq: u32) {
        let claim = (PLIC_SCLAIM + self.hart_id() * PLIC_HART_STRIDE) as *mut u32;
        // SAFETY: writing the claimed source back completes it.
        unsafe { write_volatile(claim, irq) };
    }

    fn clear_soft_pending(&self) {
        // SAFETY: clears SSIP only.
        unsafe { core::arch::asm!("csrc sip, {0}", in(reg) 2usize, options(nomem, nostack)) };
    }

    fn rearm_timer(&self) {
        let now = arch::read_time();
        let _ = sbi_rt::set_timer(now.wrapping_add(TICK_INTERVAL));
    }
}
