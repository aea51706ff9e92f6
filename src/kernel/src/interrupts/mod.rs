//! Interrupt and exception dispatch.
//!
//! The architecture entry stubs funnel every vector into
//! [`Kernel::handle_interrupt`](crate::kernel::Kernel::handle_interrupt),
//! which returns a [`Disposition`] telling the stub how to leave. This module
//! holds the vector numbers, the device IRQ table and the exception report.

pub mod exceptions;

pub use exceptions::ExceptionReport;

use alloc::vec::Vec;
use kestrel_hal::NetworkDevice;
use spin::Mutex;

/// First vector used by hardware interrupts. Lower vectors are exceptions.
pub const FIRST_IRQ: u8 = 32;
/// Local timer tick.
pub const TIMER_VECTOR: u8 = 0x20;
/// PS/2 keyboard (legacy line 1).
pub const KEYBOARD_VECTOR: u8 = 0x21;
/// PS/2 mouse (legacy line 12).
pub const MOUSE_VECTOR: u8 = 0x2C;
/// Broadcast by a panicking core: stop this core for good.
pub const HALT_VECTOR: u8 = 0xFD;
/// Local APIC spurious interrupt. Must not be acknowledged.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Number of legacy IRQ lines.
pub const LEGACY_LINES: usize = 16;

/// How the entry stub leaves the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return through `iretq` into the (possibly replaced) frame.
    Resume,
    /// Disable interrupts and halt this core forever.
    Halt,
    /// A CPU exception: print the report, then halt forever. The other cores
    /// have already been told to stop.
    Fatal(ExceptionReport),
}

/// Maps a legacy IRQ line to its interrupt vector.
pub const fn irq_vector(line: u8) -> u8 {
    FIRST_IRQ + line
}

/// Device handlers run on the boot core, keyed by legacy IRQ line.
pub struct IrqTable {
    handlers: [Option<fn()>; LEGACY_LINES],
    nics: Vec<&'static Mutex<dyn NetworkDevice>>,
}

impl IrqTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            handlers: [None; LEGACY_LINES],
            nics: Vec::new(),
        }
    }

    /// Installs `handler` for legacy `line`, returning the one it replaces.
    ///
    /// # Panics
    ///
    /// Panics if `line` is not a legacy IRQ line.
    pub fn register(&mut self, line: u8, handler: fn()) -> Option<fn()> {
        assert!((line as usize) < LEGACY_LINES, "IRQ line {} out of range", line);
        self.handlers[line as usize].replace(handler)
    }

    /// Adds a network device serviced whenever its IRQ line fires.
    pub fn register_nic(&mut self, nic: &'static Mutex<dyn NetworkDevice>) {
        self.nics.push(nic);
    }

    /// Runs every handler bound to `vector` and returns how many ran.
    ///
    /// Runs in interrupt context. A NIC whose lock is held by the interrupted
    /// code is skipped rather than waited for.
    pub fn dispatch(&self, vector: u8) -> usize {
        let Some(line) = vector.checked_sub(FIRST_IRQ) else {
            return 0;
        };
        if line as usize >= LEGACY_LINES {
            return 0;
        }

        let mut ran = 0;
        if let Some(handler) = self.handlers[line as usize] {
            handler();
            ran += 1;
        }
        for nic in &self.nics {
            match nic.try_lock() {
                Some(mut device) if device.irq() == line => {
                    device.on_interrupt();
                    ran += 1;
                }
                Some(_) => {}
                None => log::warn!("irq: NIC busy, dropped interrupt on line {}", line),
            }
        }
        ran
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static KEYS: AtomicUsize = AtomicUsize::new(0);

    fn on_key() {
        KEYS.fetch_add(1, Ordering::SeqCst);
    }

    struct FakeNic {
        line: u8,
        interrupts: usize,
    }

    impl NetworkDevice for FakeNic {
        fn irq(&self) -> u8 {
            self.line
        }

        fn on_interrupt(&mut self) {
            self.interrupts += 1;
        }

        fn send(&mut self, _data: &[u8]) {}

        fn mac_address(&self) -> [u8; 6] {
            [0x52, 0x54, 0, 0x12, 0x34, 0x56]
        }
    }

    #[test]
    fn test_dispatch_by_line() {
        let mut table = IrqTable::new();
        assert!(table.register(1, on_key).is_none());

        assert_eq!(table.dispatch(KEYBOARD_VECTOR), 1);
        assert_eq!(table.dispatch(MOUSE_VECTOR), 0);
        assert_eq!(table.dispatch(HALT_VECTOR), 0);
        assert_eq!(table.dispatch(3), 0);
        assert_eq!(KEYS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nic_matched_by_irq() {
        let nic: &'static Mutex<FakeNic> = Box::leak(Box::new(Mutex::new(FakeNic {
            line: 11,
            interrupts: 0,
        })));
        let mut table = IrqTable::new();
        table.register_nic(nic);

        assert_eq!(table.dispatch(irq_vector(11)), 1);
        assert_eq!(table.dispatch(irq_vector(10)), 0);
        assert_eq!(nic.lock().interrupts, 1);

        let held = nic.lock();
        assert_eq!(table.dispatch(irq_vector(11)), 0);
        drop(held);
    }
}
