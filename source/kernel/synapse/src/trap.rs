// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap dispatcher for user and kernel traps
//! OWNERS: @kernel-arch-team
//! PUBLIC API: TrapFrame, user_trap(), kernel_trap(), devintr(), record()/last_trap()
//! DEPENDS_ON: kmain::Kernel, hal::Platform, mm::fault, syscall
//! INVARIANTS: Page faults resolve before anything else; a failed resolution kills the
//!             task; every claimed PLIC source is completed; only the timekeeping hart ticks

use core::fmt::{self, Write};

use alloc::sync::Arc;
use spin::Mutex;

use crate::config::TIMEKEEPER_HART;
use crate::hal::Platform;
use crate::kmain::Kernel;
use crate::mm::{page_round_down, Access};
use crate::syscall::{encode_error, Args, Error as SysError};
use crate::task::Task;

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);
const CAUSE_MASK: usize = usize::MAX >> 1;

const EXC_ECALL_U: usize = 8;
const EXC_LOAD_PAGE_FAULT: usize = 13;
const EXC_STORE_PAGE_FAULT: usize = 15;

const IRQ_S_SOFT: usize = 1;
const IRQ_S_TIMER: usize = 5;
const IRQ_S_EXTERNAL: usize = 9;

/// `sstatus.SPP`: previous privilege was supervisor.
const SSTATUS_SPP: usize = 1 << 8;

const REG_A0: usize = 10;
const REG_A7: usize = 17;

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

/// Register file and trap CSRs captured on entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

impl TrapFrame {
    /// Syscall number (a7).
    #[inline]
    pub fn syscall_number(&self) -> usize {
        self.x[REG_A7]
    }

    /// Syscall arguments (a0..a5).
    #[inline]
    pub fn args(&self) -> Args {
        let mut regs = [0usize; 6];
        regs.copy_from_slice(&self.x[REG_A0..REG_A0 + 6]);
        Args::new(regs)
    }

    #[inline]
    pub fn set_return(&mut self, value: usize) {
        self.x[REG_A0] = value;
    }

    #[inline]
    pub fn return_value(&self) -> usize {
        self.x[REG_A0]
    }
}

/// What the caller of [`user_trap`] does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapExit {
    /// Return to user mode.
    Resume,
    /// Give up the CPU, then return to user mode.
    Yield,
    /// The task is gone; never return to it.
    Exit(i32),
}

/// What the caller of [`kernel_trap`] does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelTrapExit {
    Resume,
    Yield,
}

/// Device interrupt classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIrq {
    /// Supervisor timer or forwarded machine-timer software interrupt.
    Timer,
    /// PLIC interrupt, dispatched or logged.
    External,
    /// Not a device interrupt.
    Unrecognized,
}

pub fn record(frame: &TrapFrame) {
    crate::arch::riscv::without_interrupts(|| *LAST_TRAP.lock() = Some(*frame));
}

pub fn last_trap() -> Option<TrapFrame> {
    crate::arch::riscv::without_interrupts(|| *LAST_TRAP.lock())
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & CAUSE_MASK;
    if is_interrupt(scause) {
        match code {
            IRQ_S_SOFT => "SupervisorSoftInt",
            IRQ_S_TIMER => "SupervisorTimerInt",
            IRQ_S_EXTERNAL => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            EXC_ECALL_U => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            EXC_LOAD_PAGE_FAULT => "LoadPageFault",
            EXC_STORE_PAGE_FAULT => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[REG_A0..=REG_A7])
}

/// Classifies and services a device interrupt.
pub fn devintr(kernel: &Kernel, scause: usize, hw: &dyn Platform) -> DeviceIrq {
    if !is_interrupt(scause) {
        return DeviceIrq::Unrecognized;
    }
    match scause & CAUSE_MASK {
        IRQ_S_EXTERNAL => {
            if let Some(irq) = hw.claim_irq() {
                if !kernel.devices().dispatch(irq) {
                    log_warn!(target: "trap", "unexpected interrupt irq={}", irq);
                }
                hw.complete_irq(irq);
            }
            DeviceIrq::External
        }
        IRQ_S_SOFT => {
            clock_tick(kernel, hw);
            hw.clear_soft_pending();
            DeviceIrq::Timer
        }
        IRQ_S_TIMER => {
            clock_tick(kernel, hw);
            hw.rearm_timer();
            DeviceIrq::Timer
        }
        _ => DeviceIrq::Unrecognized,
    }
}

fn clock_tick(kernel: &Kernel, hw: &dyn Platform) {
    if hw.hart_id() == TIMEKEEPER_HART {
        kernel.clock().tick();
    }
}

/// Handles a trap taken from user mode on behalf of `task`.
///
/// Page faults go to the resolver, environment calls to the syscall table,
/// interrupts to [`devintr`]. Anything else kills the task. A killed task is
/// torn down here and reported as [`TrapExit::Exit`].
pub fn user_trap(kernel: &Kernel, task: &Arc<Task>, frame: &mut TrapFrame, hw: &dyn Platform) -> TrapExit {
    if frame.sstatus & SSTATUS_SPP != 0 {
        panic!("usertrap: not from user mode");
    }
    record(frame);

    let mut device = DeviceIrq::Unrecognized;
    match frame.scause {
        EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT => {
            let access = Access::from_scause(frame.scause).unwrap_or(Access::Load);
            if let Err(err) = kernel.resolve_fault(task, frame.stval, access) {
                log_error!(
                    target: "trap",
                    "usertrap(): {} {:#x} pid={}",
                    err.describe(),
                    page_round_down(frame.stval),
                    task.pid()
                );
                task.kill();
            }
        }
        EXC_ECALL_U => {
            if task.is_killed() {
                return exit(kernel, task, -1);
            }
            frame.sepc = frame.sepc.wrapping_add(4);
            hw.intr_on();
            match kernel.syscall(task, frame.syscall_number(), &frame.args()) {
                Ok(value) => frame.set_return(value),
                Err(SysError::Exit(code)) => return exit(kernel, task, code),
                Err(err) => {
                    log_debug!(
                        target: "syscall",
                        "pid={} nr={} failed: {}",
                        task.pid(),
                        frame.syscall_number(),
                        err
                    );
                    frame.set_return(encode_error(err));
                }
            }
        }
        scause => {
            device = devintr(kernel, scause, hw);
            if device == DeviceIrq::Unrecognized {
                log_error!(
                    target: "trap",
                    "usertrap(): unexpected scause {:#x} ({}) pid={} sepc={:#x} stval={:#x}",
                    scause,
                    describe_cause(scause),
                    task.pid(),
                    frame.sepc,
                    frame.stval
                );
                task.kill();
            }
        }
    }

    if task.is_killed() {
        return exit(kernel, task, -1);
    }
    if device == DeviceIrq::Timer {
        TrapExit::Yield
    } else {
        TrapExit::Resume
    }
}

fn exit(kernel: &Kernel, task: &Task, code: i32) -> TrapExit {
    kernel.exit_task(task, code);
    TrapExit::Exit(code)
}

/// Handles a trap taken while the hart ran in supervisor mode.
///
/// Only device interrupts are legal here; `running` reports whether a task was
/// executing kernel code when the trap hit.
pub fn kernel_trap(kernel: &Kernel, frame: &TrapFrame, hw: &dyn Platform, running: bool) -> KernelTrapExit {
    if frame.sstatus & SSTATUS_SPP == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if hw.intr_enabled() {
        panic!("kerneltrap: interrupts enabled");
    }
    match devintr(kernel, frame.scause, hw) {
        DeviceIrq::Unrecognized => {
            record(frame);
            panic!(
                "kerneltrap: scause={:#x} ({}) sepc={:#x} stval={:#x}",
                frame.scause,
                describe_cause(frame.scause),
                frame.sepc,
                frame.stval
            );
        }
        DeviceIrq::Timer if running => KernelTrapExit::Yield,
        _ => KernelTrapExit::Resume,
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod vector {
    use super::{kernel_trap, KernelTrapExit, TrapFrame};
    use crate::hal::virt::VirtPlatform;

    // Saves the caller-saved registers, calls into Rust and returns with `sret`.
    core::arch::global_asm!(
        r#"
    .section .text
    .globl __kernel_vec
    .align 4
__kernel_vec:
    addi sp, sp, -128
    sd ra, 0(sp)
    sd t0, 8(sp)
    sd t1, 16(sp)
    sd t2, 24(sp)
    sd t3, 32(sp)
    sd t4, 40(sp)
    sd t5, 48(sp)
    sd t6, 56(sp)
    sd a0, 64(sp)
    sd a1, 72(sp)
    sd a2, 80(sp)
    sd a3, 88(sp)
    sd a4, 96(sp)
    sd a5, 104(sp)
    sd a6, 112(sp)
    sd a7, 120(sp)
    call kernel_trap_entry
    ld ra, 0(sp)
    ld t0, 8(sp)
    ld t1, 16(sp)
    ld t2, 24(sp)
    ld t3, 32(sp)
    ld t4, 40(sp)
    ld t5, 48(sp)
    ld t6, 56(sp)
    ld a0, 64(sp)
    ld a1, 72(sp)
    ld a2, 80(sp)
    ld a3, 88(sp)
    ld a4, 96(sp)
    ld a5, 104(sp)
    ld a6, 112(sp)
    ld a7, 120(sp)
    addi sp, sp, 128
    sret
"#
    );

    extern "C" {
        fn __kernel_vec();
    }

    macro_rules! csrr {
        ($csr:literal) => {{
            let value: usize;
            // SAFETY: reading a trap CSR has no side effects.
            unsafe { core::arch::asm!(concat!("csrr {0}, ", $csr), out(reg) value, options(nomem, nostack)) };
            value
        }};
    }

    #[no_mangle]
    extern "C" fn kernel_trap_entry() {
        let frame = TrapFrame {
            sepc: csrr!("sepc"),
            sstatus: csrr!("sstatus"),
            scause: csrr!("scause"),
            stval: csrr!("stval"),
            ..TrapFrame::default()
        };
        let Some(kernel) = crate::kmain::kernel() else {
            panic!("kerneltrap before kernel init: scause={:#x} sepc={:#x}", frame.scause, frame.sepc);
        };
        // No task ever runs kernel code on this hart, so a timer never yields here.
        let exit = kernel_trap(kernel, &frame, &VirtPlatform, false);
        debug_assert_eq!(exit, KernelTrapExit::Resume);
    }

    /// Installs the supervisor trap vector on this hart.
    ///
    /// # Safety
    /// Must run on each hart before interrupts are enabled.
    pub unsafe fn install() {
        // SAFETY: `__kernel_vec` preserves every register it clobbers.
        unsafe { crate::arch::riscv::set_trap_vector(__kernel_vec as usize) };
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use vector::install as install_kernel_vector;
