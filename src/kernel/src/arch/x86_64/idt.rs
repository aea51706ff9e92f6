//! Interrupt Descriptor Table.
//!
//! All 256 vectors point at the entry stubs; the double fault runs on its own
//! IST stack so a kernel stack overflow still produces a report.

use super::entry::stub_address;
use super::gdt;
use lazy_static::lazy_static;
use spin::Once;
use x86_64::instructions::tables::sidt;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

fn stub(vector: u8) -> VirtAddr {
    VirtAddr::new(stub_address(vector))
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: every stub is a valid interrupt entry that ends in `iretq`.
        unsafe {
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.non_maskable_interrupt.set_handler_addr(stub(2));
            idt.breakpoint.set_handler_addr(stub(3));
            idt.overflow.set_handler_addr(stub(4));
            idt.bound_range_exceeded.set_handler_addr(stub(5));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.device_not_available.set_handler_addr(stub(7));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub(10));
            idt.segment_not_present.set_handler_addr(stub(11));
            idt.stack_segment_fault.set_handler_addr(stub(12));
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            idt.x87_floating_point.set_handler_addr(stub(16));
            idt.alignment_check.set_handler_addr(stub(17));
            idt.machine_check.set_handler_addr(stub(18));
            idt.simd_floating_point.set_handler_addr(stub(19));
            idt.virtualization.set_handler_addr(stub(20));
            idt.security_exception.set_handler_addr(stub(30));
            for vector in 32..=255u8 {
                idt[vector as usize].set_handler_addr(stub(vector));
            }
        }
        idt
    };
}

static POINTER: Once<DescriptorTablePointer> = Once::new();

/// Loads the IDT on the calling core.
///
/// Secondary cores get the table from the mailbox instead.
pub fn init() {
    IDT.load();
    POINTER.call_once(sidt);
}

/// Address of the `lidt` operand, or 0 before [`init`].
pub fn pointer_address() -> u64 {
    POINTER
        .get()
        .map_or(0, |p| p as *const DescriptorTablePointer as u64)
}
