//! Kernel heap allocation.
//!
//! `alloc` collections (thread list, IRQ table, platform tables) live in a
//! `LockedHeap` whose backing store is one pinned run of the page allocator.

use crate::arch::without_interrupts;
use crate::memory::PageAllocator;
use kestrel_common::AllocError;
use linked_list_allocator::LockedHeap;
use spin::Mutex;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Carves `size` bytes out of the page region and hands them to the global
/// allocator. Returns the heap's base address.
pub fn init_heap<const N: usize>(
    pages: &Mutex<PageAllocator<N>>,
    size: usize,
) -> Result<usize, AllocError> {
    let start = without_interrupts(|| {
        let mut pages = pages.lock();
        let start = pages.allocate(size)?;
        pages.set_fixed(start)?;
        Ok::<_, AllocError>(start)
    })?;

    // SAFETY: the run was just allocated, is identity-mapped, pinned against
    // reclamation and never freed. This function is only called once.
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
    Ok(start)
}

/// Bytes of heap in use.
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}
