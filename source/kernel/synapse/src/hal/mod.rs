// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware abstraction consumed by the trap path
//! OWNERS: @kernel-arch-team
//! PUBLIC API: Platform (trait), DeviceTable, IrqHandler, HalError
//! DEPENDS_ON: spin::Mutex; hal::virt on the target
//! INVARIANTS: Every claimed PLIC source is completed exactly once

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

use spin::Mutex;

use crate::config::MAX_IRQ_HANDLERS;

/// Per-hart interrupt and timer operations.
pub trait Platform {
    fn hart_id(&self) -> usize;
    /// Enables supervisor interrupts on this hart.
    fn intr_on(&self);
    fn intr_enabled(&self) -> bool;
    /// Claims the highest-priority pending external interrupt.
    fn claim_irq(&self) -> Option<u32>;
    fn complete_irq(&self, irq: u32);
    /// Acknowledges a forwarded machine-timer software interrupt.
    fn clear_soft_pending(&self);
    /// Programs the next supervisor timer interrupt.
    fn rearm_timer(&self);
}

/// Driver entry point for one interrupt source.
pub type IrqHandler = fn(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// All handler slots are taken.
    TableFull,
    /// A handler is already registered for this source.
    AlreadyRegistered,
}

/// Interrupt source to driver routing.
pub struct DeviceTable {
    handlers: Mutex<[Option<(u32, IrqHandler)>; MAX_IRQ_HANDLERS]>,
}

impl DeviceTable {
    pub const fn new() -> Self {
        Self { handlers: Mutex::new([None; MAX_IRQ_HANDLERS]) }
    }

    pub fn register(&self, irq: u32, handler: IrqHandler) -> Result<(), HalError> {
        // `dispatch` runs in interrupt context and takes the same lock.
        crate::arch::riscv::without_interrupts(|| {
            let mut handlers = self.handlers.lock();
            if handlers.iter().flatten().any(|(source, _)| *source == irq) {
                return Err(HalError::AlreadyRegistered);
            }
            let slot =
                handlers.iter_mut().find(|slot| slot.is_none()).ok_or(HalError::TableFull)?;
            *slot = Some((irq, handler));
            Ok(())
        })
    }

    /// Runs the handler for `irq`. Returns false when no driver owns the source.
    pub fn dispatch(&self, irq: u32) -> bool {
        let handler = self
            .handlers
            .lock()
            .iter()
            .flatten()
            .find(|(source, _)| *source == irq)
            .map(|(_, handler)| *handler);
        match handler {
            Some(handler) => {
                handler(irq);
                true
            }
            None => false,
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static LAST: AtomicU32 = AtomicU32::new(0);

    fn record(irq: u32) {
        LAST.store(irq, Ordering::SeqCst);
    }

    #[test]
    fn dispatch_routes_registered_sources() {
        let table = DeviceTable::new();
        table.register(10, record).unwrap();
        assert_eq!(table.register(10, record), Err(HalError::AlreadyRegistered));
        assert!(table.dispatch(10));
        assert_eq!(LAST.load(Ordering::SeqCst), 10);
        assert!(!table.dispatch(3));
    }

    #[test]
    fn table_is_bounded() {
        let table = DeviceTable::new();
        for irq in 0..MAX_IRQ_HANDLERS as u32 {
            table.register(irq, record).unwrap();
        }
        assert_eq!(table.register(99, record), Err(HalError::TableFull));
    }
}
