// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! NS16550 console on the QEMU `virt` machine; log sink and panic writer.

use core::fmt::{self, Write};
use spin::Mutex;

const UART0_BASE: usize = 0x1000_0000;
const UART_THR: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

/// UART transmitter capable of formatted writes.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    fn put(&self, byte: u8) {
        put_mmio(self.base, byte);
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}

fn put_mmio(base: usize, byte: u8) {
    // SAFETY: UART0 is identity mapped in every kernel page table on `virt`.
    unsafe {
        while core::ptr::read_volatile((base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
        core::ptr::write_volatile((base + UART_THR) as *mut u8, byte);
    }
}

/// Lock-free writer for trap/panic contexts where the console mutex may be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                put_mmio(UART0_BASE, b'\r');
            }
            put_mmio(UART0_BASE, byte);
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}

/// Reads one pending byte from the receive holding register, if any.
pub fn poll_byte() -> Option<u8> {
    const UART_RHR: usize = 0x0;
    const LSR_RX_READY: u8 = 1 << 0;
    // SAFETY: see `put_mmio`.
    unsafe {
        if core::ptr::read_volatile((UART0_BASE + UART_LSR) as *const u8) & LSR_RX_READY == 0 {
            return None;
        }
        Some(core::ptr::read_volatile((UART0_BASE + UART_RHR) as *const u8))
    }
}
