//! Boot-time physical frame allocator.
//!
//! Hands out usable frames from the bootloader's memory map for page-table
//! pages. Frames below 1 MiB (mailbox, trampoline, firmware) and frames inside
//! the page allocator's region are never returned.

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use core::ops::Range;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

const LOW_MEMORY_END: u64 = 0x10_0000;

/// Frame allocator walking the bootloader memory map.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    reserved: Range<u64>,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Creates a frame allocator that never returns frames in `reserved`.
    ///
    /// # Safety
    ///
    /// The memory map must be valid and every frame marked usable must really
    /// be unused.
    pub unsafe fn init(memory_map: &'static MemoryMap, reserved: Range<u64>) -> Self {
        BootInfoFrameAllocator {
            memory_map,
            reserved,
            next: 0,
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
            .map(|r| r.range.start_addr()..r.range.end_addr())
            .flat_map(|r| r.step_by(4096))
            .filter(move |addr| *addr >= LOW_MEMORY_END && !self.reserved.contains(addr))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

// SAFETY: `usable_frames` only yields frames the memory map reports as usable
// and `next` makes sure each is handed out once.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

/// Whether every frame of `range` is usable RAM according to the memory map.
pub fn is_usable(memory_map: &MemoryMap, range: Range<u64>) -> bool {
    let mut next = range.start;
    while next < range.end {
        let covering = memory_map.iter().find(|r| {
            r.region_type == MemoryRegionType::Usable
                && r.range.start_addr() <= next
                && r.range.end_addr() > next
        });
        match covering {
            Some(region) => next = region.range.end_addr(),
            None => return false,
        }
    }
    true
}
