// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V helpers. Host builds get inert stand-ins so the memory and trap
//! logic above them can run under `cargo test`.

/// Reads the `time` CSR (10 MHz on QEMU `virt`).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        ::riscv::register::time::read() as u64
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Drops every cached translation on this hart.
#[inline]
pub fn flush_tlb() {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: `sfence.vma` has no memory effects visible to Rust.
    unsafe {
        core::arch::asm!("sfence.vma x0, x0", options(nostack));
    }
}

/// Issues a WFI instruction or spins on the host.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: `wfi` only stalls the hart.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

/// Points `stvec` at `vector` in direct mode.
///
/// # Safety
/// `vector` must be a 4-byte aligned trap entry that preserves every register it clobbers.
#[inline]
pub unsafe fn set_trap_vector(vector: usize) {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: forwarded to the caller.
    unsafe {
        ::riscv::register::stvec::write(vector, ::riscv::register::stvec::TrapMode::Direct);
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = vector;
    }
}

/// Runs `f` with supervisor interrupts masked on this hart, restoring the previous
/// `sstatus.SIE` afterwards. Host builds just call `f`.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(target_arch = "riscv64")]
    {
        use ::riscv::register::sstatus;
        let was_enabled = sstatus::read().sie();
        if was_enabled {
            // SAFETY: masking interrupts on the current hart cannot break memory safety.
            unsafe { sstatus::clear_sie() };
        }
        let result = f();
        if was_enabled {
            // SAFETY: restores the state observed on entry.
            unsafe { sstatus::set_sie() };
        }
        result
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        f()
    }
}
