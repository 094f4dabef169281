// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot wrapper for the SYNAPSE kernel. Provides the `_start` entry point that
//! sets up the stack, keeps the hart id in `tp`, clears `.bss` and hands
//! execution to `synapse::kmain()`.
#![no_std]
#![no_main]

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text._start, "ax", @progbits
    .globl _start
    .align 4
_start:
    la   sp, __stack_top
    mv   tp, a0
    .option push
    .option norelax
    la   gp, __global_pointer$
    .option pop
    la   t0, __bss_start
    la   t1, __bss_end
1:
    bgeu t0, t1, 2f
    sd   zero, 0(t0)
    addi t0, t0, 8
    j    1b
2:
    j    start_rust
"#
);

#[no_mangle]
pub extern "C" fn start_rust() -> ! {
    synapse::kmain()
}
