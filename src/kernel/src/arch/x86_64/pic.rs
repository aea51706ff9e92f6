//! Support for the primary and secondary 8259 Programmable Interrupt Controllers (PICs).
//!
//! The PICs only deliver the legacy input devices. They are remapped above the
//! exception vectors and reach the boot core through LINT0 in ExtINT mode; the
//! PIT line stays masked since the local APIC timer drives scheduling.

use crate::interrupts::{FIRST_IRQ, TIMER_VECTOR};
use pic8259::ChainedPics;
use spin::Mutex;

/// The offset of the first PIC (master).
///
/// IRQs 0..7 are mapped to interrupts 32..39.
pub const PIC_1_OFFSET: u8 = FIRST_IRQ;

/// The offset of the second PIC (slave).
///
/// IRQs 8..15 are mapped to interrupts 40..47.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Master mask: only keyboard (1) and cascade (2) open.
const MASTER_MASK: u8 = 0xF9;
/// Slave mask: only the PS/2 mouse (12) open.
const SLAVE_MASK: u8 = 0xEF;

/// The global instance of the chained PICs.
// SAFETY: the offsets do not overlap the exception vectors.
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remaps both PICs and applies the device masks.
pub fn init() {
    let mut pics = PICS.lock();
    // SAFETY: runs once on the boot core before interrupts are enabled.
    unsafe {
        pics.initialize();
        pics.write_masks(MASTER_MASK, SLAVE_MASK);
    }
}

/// Whether `vector` came from a PIC device line. IRQ 0 is excluded because its
/// vector is shared with the local timer.
pub fn is_legacy_device(vector: u8) -> bool {
    vector > TIMER_VECTOR && vector < PIC_2_OFFSET + 8
}

/// Acknowledges a PIC interrupt.
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: `vector` is a PIC vector that is currently being serviced.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
