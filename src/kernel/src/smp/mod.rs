//! Secondary core bring-up.
//!
//! The boot core publishes everything a woken core needs in a mailbox at a
//! fixed low physical address, then wakes the other cores one at a time with
//! INIT followed by STARTUP. Each woken core runs the trampoline, reads the
//! mailbox and bumps its activation counter as the first thing it does in Rust.
//! The boot core waits for that bump before waking the next core, so at most
//! one core is ever reading the mailbox's stack assignment.
//!
//! Mailbox layout (byte offsets):
//!
//! | offset | size | contents                                  |
//! |--------|------|-------------------------------------------|
//! | 0x00   | 2    | activated core counter                    |
//! | 0x08   | 8    | secondary entry point                     |
//! | 0x10   | 8    | base of the shared stack region           |
//! | 0x18   | 8    | stack size per core                       |
//! | 0x20   | 8    | address of the GDT pointer (`lgdt` operand) |
//! | 0x28   | 8    | address of the IDT pointer (`lidt` operand) |
//! | 0x30   | 8    | page-table root (CR3)                     |

use crate::config::BOOT_CORE;
use crate::sync::spin_until;
use core::sync::atomic::{AtomicU16, Ordering};
use kestrel_common::SmpError;
use kestrel_hal::LocalInterruptController;

/// Offset of the activated core counter.
pub const ACTIVATED: usize = 0x00;
/// Offset of the secondary entry point.
pub const ENTRY: usize = 0x08;
/// Offset of the stack region base.
pub const STACKS: usize = 0x10;
/// Offset of the per-core stack size.
pub const STACK_SIZE: usize = 0x18;
/// Offset of the GDT pointer address.
pub const GDT: usize = 0x20;
/// Offset of the IDT pointer address.
pub const IDT: usize = 0x28;
/// Offset of the page-table root.
pub const PAGE_TABLE: usize = 0x30;
/// Bytes of the mailbox in use.
pub const MAILBOX_SIZE: usize = 0x38;

/// Data the boot core hands to every secondary core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootData {
    /// Address of `extern "C" fn(apic_id: u32) -> !` the trampoline calls.
    pub entry: u64,
    /// Base of the stack region; core `n` uses slot `n`.
    pub stacks: u64,
    /// Bytes per stack slot.
    pub stack_size: u64,
    /// Address of the boot core's GDT pointer.
    pub gdt: u64,
    /// Address of the boot core's IDT pointer.
    pub idt: u64,
    /// Physical address of the top-level page table.
    pub page_table: u64,
}

/// Bytes of stack region needed so every core id in `cores` has a slot.
pub fn stack_region_size(cores: &[u32], stack_size: usize) -> usize {
    let slots = cores.iter().copied().max().map_or(1, |id| id as usize + 1);
    slots * stack_size
}

/// The bring-up mailbox.
pub struct Mailbox {
    base: *mut u8,
}

// SAFETY: the counter is accessed atomically; the other fields are written by
// the boot core before any secondary core is woken and only read afterwards.
unsafe impl Send for Mailbox {}
// SAFETY: see above.
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Wraps the mailbox at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of [`MAILBOX_SIZE`] bytes,
    /// 8-byte aligned, and used for nothing else while the mailbox is in use.
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    /// Address of the mailbox.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    fn counter(&self) -> &AtomicU16 {
        // SAFETY: `new` guarantees the counter's two bytes are valid and
        // aligned, and they are only ever accessed atomically.
        unsafe { &*(self.base.add(ACTIVATED) as *const AtomicU16) }
    }

    /// Number of cores that have reached the kernel, boot core included.
    pub fn activated(&self) -> u16 {
        self.counter().load(Ordering::Acquire)
    }

    /// Reports the calling core as alive. Returns the new count.
    pub fn mark_active(&self) -> u16 {
        self.counter().fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Writes `data` and sets the counter to one for the boot core.
    pub fn publish(&self, data: &BootData) {
        // SAFETY: every offset lies inside the MAILBOX_SIZE bytes `new`
        // vouched for and is 8-byte aligned.
        unsafe {
            self.write(ENTRY, data.entry);
            self.write(STACKS, data.stacks);
            self.write(STACK_SIZE, data.stack_size);
            self.write(GDT, data.gdt);
            self.write(IDT, data.idt);
            self.write(PAGE_TABLE, data.page_table);
        }
        self.counter().store(1, Ordering::Release);
    }

    /// Reads back the published data.
    pub fn read(&self) -> BootData {
        // SAFETY: as in `publish`.
        unsafe {
            BootData {
                entry: self.read_at(ENTRY),
                stacks: self.read_at(STACKS),
                stack_size: self.read_at(STACK_SIZE),
                gdt: self.read_at(GDT),
                idt: self.read_at(IDT),
                page_table: self.read_at(PAGE_TABLE),
            }
        }
    }

    unsafe fn write(&self, offset: usize, value: u64) {
        // SAFETY: upheld by the caller.
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u64, value) };
    }

    unsafe fn read_at(&self, offset: usize) -> u64 {
        // SAFETY: upheld by the caller.
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u64) }
    }
}

/// Wakes every core in `cores` other than the caller, one at a time.
///
/// The caller must be the boot core. Returns the number of cores started.
pub fn start_secondary_cores(
    lapic: &dyn LocalInterruptController,
    mailbox: &Mailbox,
    boot: &BootData,
    cores: &[u32],
    trampoline_page: u8,
    spin_limit: u64,
) -> Result<usize, SmpError> {
    let bsp = lapic.id();
    if bsp != BOOT_CORE {
        return Err(SmpError::BootstrapNotCoreZero { core: bsp });
    }

    mailbox.publish(boot);

    let mut started = 0;
    for &id in cores.iter().filter(|&&id| id != bsp) {
        let last = mailbox.activated();
        lapic.send_init(id);
        lapic.send_startup(id, trampoline_page);
        let spins = spin_until(spin_limit, "startup handshake", || mailbox.activated() != last)
            .map_err(|_| SmpError::HandshakeTimeout { core: id })?;
        log::debug!("smp: core {} answered after {} spins", id, spins);
        started += 1;
    }
    Ok(started)
}
