//! Global Descriptor Table and Task State Segment.
//!
//! Layout: null, kernel code (`0x08`), kernel data (`0x10`), TSS (`0x18`).
//! Thread frames are built with the code and data selectors, so their values
//! are fixed. A TSS descriptor is marked busy once loaded, so every secondary
//! core switches from the boot table it arrived with to a private copy whose
//! TSS has the core's own double fault stack.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::Once;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::{load_tss, sgdt};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

/// IST slot used by the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct FaultStack([u8; DOUBLE_FAULT_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: FaultStack = FaultStack([0; DOUBLE_FAULT_STACK_SIZE]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(DOUBLE_FAULT_STACK) });
            start + DOUBLE_FAULT_STACK_SIZE
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = table(&TSS);
}

#[derive(Clone, Copy)]
struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

fn table(tss: &'static TaskStateSegment) -> (GlobalDescriptorTable, Selectors) {
    let mut gdt = GlobalDescriptorTable::new();
    let code = gdt.add_entry(Descriptor::kernel_code_segment());
    let data = gdt.add_entry(Descriptor::kernel_data_segment());
    let tss = gdt.add_entry(Descriptor::tss_segment(tss));
    (gdt, Selectors { code, data, tss })
}

/// Reloads the segment registers and the task register.
///
/// # Safety
///
/// `selectors` must index the GDT loaded on this core.
unsafe fn load_selectors(selectors: Selectors) {
    // SAFETY: upheld by the caller.
    unsafe {
        CS::set_reg(selectors.code);
        SS::set_reg(selectors.data);
        DS::set_reg(selectors.data);
        ES::set_reg(selectors.data);
        load_tss(selectors.tss);
    }
    TSS_LOADED.fetch_add(1, Ordering::AcqRel);
}

static TSS_LOADED: AtomicU32 = AtomicU32::new(0);

/// The loaded table's `lgdt` operand, kept for secondary cores.
static POINTER: Once<DescriptorTablePointer> = Once::new();

/// Loads the GDT and TSS on the boot core and reloads the segment registers.
pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors index the table loaded just above.
    unsafe { load_selectors(GDT.1) };
    POINTER.call_once(sgdt);
}

/// Gives the calling secondary core its own GDT and TSS, with a heap-backed
/// double fault stack, and loads them.
pub fn init_secondary() {
    let stack: &'static mut [u8] = alloc::vec![0u8; DOUBLE_FAULT_STACK_SIZE].leak();
    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
        (VirtAddr::from_ptr(stack.as_ptr()) + DOUBLE_FAULT_STACK_SIZE).align_down(16u64);
    let tss: &'static TaskStateSegment = Box::leak(Box::new(tss));

    let (gdt, selectors) = table(tss);
    let gdt: &'static GlobalDescriptorTable = Box::leak(Box::new(gdt));
    debug_assert!(selectors.code == GDT.1.code && selectors.data == GDT.1.data);
    gdt.load();
    // SAFETY: same layout as the boot table, loaded just above.
    unsafe { load_selectors(selectors) };
}

/// Number of cores that have loaded a TSS.
pub fn cores_with_tss() -> u32 {
    TSS_LOADED.load(Ordering::Acquire)
}

/// Address of the boot core's `lgdt` operand, or 0 before [`init`].
pub fn pointer_address() -> u64 {
    POINTER
        .get()
        .map_or(0, |p| p as *const DescriptorTablePointer as u64)
}
