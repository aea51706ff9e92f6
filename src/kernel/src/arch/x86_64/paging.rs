//! Page table setup.
//!
//! The bootloader maps all physical memory at an offset. On top of that the
//! kernel identity-maps the page region, the bring-up mailbox and trampoline,
//! and the local APIC registers, so their physical addresses can be used
//! directly by every core, the trampoline included.

use spin::{Mutex, Once};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::page_table::FrameError;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

static MAPPER: Once<Mutex<OffsetPageTable<'static>>> = Once::new();
static PHYSICAL_OFFSET: Once<u64> = Once::new();

/// Takes over the active page tables.
///
/// # Safety
///
/// All physical memory must be mapped at `physical_memory_offset`, and this
/// must be called only once.
pub unsafe fn init(physical_memory_offset: VirtAddr) {
    PHYSICAL_OFFSET.call_once(|| physical_memory_offset.as_u64());
    MAPPER.call_once(|| {
        // SAFETY: upheld by the caller.
        let level_4 = unsafe { active_level_4_table(physical_memory_offset) };
        // SAFETY: upheld by the caller.
        Mutex::new(unsafe { OffsetPageTable::new(level_4, physical_memory_offset) })
    });
}

unsafe fn active_level_4_table(offset: VirtAddr) -> &'static mut PageTable {
    let (frame, _) = Cr3::read();
    let virt = offset + frame.start_address().as_u64();
    // SAFETY: the caller guarantees the offset mapping.
    unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
}

/// Physical address of the active top-level table.
pub fn page_table_root() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Identity-maps `[start, start + len)` with `flags`. Pages already mapped to
/// themselves are left alone.
pub fn identity_map(
    start: u64,
    len: u64,
    flags: PageTableFlags,
    frames: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MapToError<Size4KiB>> {
    let mapper = MAPPER.get().ok_or(MapToError::FrameAllocationFailed)?;
    let mut mapper = mapper.lock();
    let first = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(start));
    let last = PhysFrame::containing_address(PhysAddr::new(start + len.max(1) - 1));
    for frame in PhysFrame::range_inclusive(first, last) {
        let address = frame.start_address();
        if mapper.translate_addr(VirtAddr::new(address.as_u64())) == Some(address) {
            continue;
        }
        // SAFETY: the frame is either reserved memory the kernel owns or MMIO,
        // and mapping it at its own address aliases nothing the kernel uses.
        unsafe {
            mapper.identity_map(frame, flags, frames)?.flush();
        }
    }
    Ok(())
}

/// Reports whether any page of the run at `address` was accessed since the
/// previous call, and clears the accessed bits.
///
/// Only clears this core's TLB entries, so a core that keeps using a cached
/// translation may look idle for one scan longer than it is.
pub fn take_accessed(address: usize, pages: usize) -> bool {
    let (Some(mapper), Some(&offset)) = (MAPPER.get(), PHYSICAL_OFFSET.get()) else {
        return true;
    };
    let mut mapper = mapper.lock();
    let mut accessed = false;
    for n in 0..pages {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new((address + n * 4096) as u64));
        if let Some(entry_flags) = clear_accessed(mapper.level_4_table(), offset, page) {
            if entry_flags.contains(PageTableFlags::ACCESSED) {
                accessed = true;
                x86_64::instructions::tlb::flush(page.start_address());
            }
        }
    }
    accessed
}

/// Table behind a non-leaf entry.
///
/// # Safety
///
/// Page-table frames must be reachable through the offset mapping.
unsafe fn next_table<'a>(
    offset: u64,
    frame: Result<PhysFrame, FrameError>,
) -> Option<&'a mut PageTable> {
    let virt = offset + frame.ok()?.start_address().as_u64();
    // SAFETY: upheld by the caller.
    Some(unsafe { &mut *(virt as *mut PageTable) })
}

fn clear_accessed(level_4: &mut PageTable, offset: u64, page: Page) -> Option<PageTableFlags> {
    // SAFETY: `init` established the offset mapping. Huge pages stop the walk.
    let level_1 = unsafe {
        let level_3 = next_table(offset, level_4[page.p4_index()].frame())?;
        let level_2 = next_table(offset, level_3[page.p3_index()].frame())?;
        next_table(offset, level_2[page.p2_index()].frame())?
    };
    let entry = &mut level_1[page.p1_index()];
    let flags = entry.flags();
    if flags.contains(PageTableFlags::PRESENT) {
        entry.set_flags(flags - PageTableFlags::ACCESSED);
        Some(flags)
    } else {
        None
    }
}
