// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler emitting diagnostics over the raw UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::last_trap(), uart::raw_writer()
//! INVARIANTS: No allocation and no console lock; stable output fields

use core::{fmt::Write, panic::PanicInfo};

use crate::{trap, uart};

fn write_hex(w: &mut uart::RawUart, value: usize) {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    for shift in (0..usize::BITS).step_by(4).rev() {
        let _ = w.write_char(LUT[(value >> shift) & 0xf] as char);
    }
}

/// Prints the panic location, message and last recorded trap, then parks the hart.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();

    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = write!(w, "{}\n", info.message());

    if let Some(frame) = trap::last_trap() {
        let _ = w.write_str("PANIC: last trap: sepc=0x");
        write_hex(&mut w, frame.sepc);
        let _ = w.write_str(" scause=0x");
        write_hex(&mut w, frame.scause);
        let _ = w.write_str(" stval=0x");
        write_hex(&mut w, frame.stval);
        let _ = w.write_str("\n");
    }

    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}
