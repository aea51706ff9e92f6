//! First-fit page allocator over a fixed physical region.
//!
//! The region is described by two arrays indexed by page number. `pages`
//! records which pages start a run, which continue one and which are free.
//! `flags` carries the reclamation age and markers of each run's first page.
//!
//! The allocator has no lock of its own; the kernel wraps it in a mutex that
//! is only taken with interrupts disabled.

use crate::config::PAGE_SIZE;
use crate::memory::raw;
use kestrel_common::{AllocError, PageFlags};

/// Metadata for one page of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageState {
    /// Not part of any allocation.
    #[default]
    Free,
    /// First page of an allocation spanning `pages` pages.
    Head {
        /// Length of the run in pages.
        pages: u32,
    },
    /// A page inside an allocation, after its head.
    Continuation,
}

/// A page allocator managing `N` pages.
pub struct PageAllocator<const N: usize> {
    start: usize,
    initialized: bool,
    pub(super) pages: [PageState; N],
    pub(super) flags: [PageFlags; N],
}

impl<const N: usize> PageAllocator<N> {
    /// Creates an allocator with no region attached.
    pub const fn new() -> Self {
        Self {
            start: 0,
            initialized: false,
            pages: [PageState::Free; N],
            flags: [PageFlags::empty(); N],
        }
    }

    /// Attaches the allocator to the region starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if called twice or if `start` is not page aligned.
    pub fn initialize(&mut self, start: usize) {
        assert!(!self.initialized, "page allocator initialized twice");
        assert_eq!(start % PAGE_SIZE, 0, "page region must be page aligned");
        self.start = start;
        self.initialized = true;
    }

    /// Returns whether [`PageAllocator::initialize`] has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Base address of the region.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Total size of the region in bytes.
    pub const fn size(&self) -> usize {
        N * PAGE_SIZE
    }

    /// Number of pages a request of `size` bytes occupies. Zero-sized
    /// requests still get a page of their own.
    pub fn pages_for(size: usize) -> usize {
        size.div_ceil(PAGE_SIZE).max(1)
    }

    /// Reserves the first run of free pages large enough for `size` bytes.
    ///
    /// The returned memory is not zeroed.
    pub fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        if !self.initialized {
            return Err(AllocError::Uninitialized);
        }
        let needed = Self::pages_for(size);
        let first = self
            .find_run(needed)
            .ok_or(AllocError::OutOfMemory { requested: size })?;

        self.pages[first] = PageState::Head {
            pages: needed as u32,
        };
        for page in &mut self.pages[first + 1..first + needed] {
            *page = PageState::Continuation;
        }
        self.flags[first] = PageFlags::empty();

        Ok(self.address_of(first))
    }

    /// Reserves memory like [`PageAllocator::allocate`] and zero-fills it.
    ///
    /// # Safety
    ///
    /// The region must be mapped and writable at its recorded address.
    pub unsafe fn allocate_zeroed(&mut self, size: usize) -> Result<usize, AllocError> {
        let address = self.allocate(size)?;
        // SAFETY: the run was just reserved and the caller guarantees the
        // region is mapped, so the whole run is ours to write.
        unsafe { raw::zero_fill(address as *mut u8, Self::pages_for(size) * PAGE_SIZE) };
        Ok(address)
    }

    /// Releases the run starting at `address` and returns its size in bytes.
    ///
    /// An address that is not the start of a live run is rejected and leaves
    /// the metadata untouched.
    pub fn free(&mut self, address: usize) -> Result<usize, AllocError> {
        let index = self.head_index(address)?;
        let pages = self.run_length(index);
        for page in &mut self.pages[index..index + pages] {
            *page = PageState::Free;
        }
        self.flags[index] = PageFlags::empty();
        Ok(pages * PAGE_SIZE)
    }

    /// Moves the allocation at `address` into a fresh run of `new_size` bytes.
    ///
    /// The first `min(old, new_size)` bytes are copied. The run always moves,
    /// even when the size does not change.
    ///
    /// # Safety
    ///
    /// The region must be mapped, and nothing may still reference the old run
    /// once this returns.
    pub unsafe fn reallocate(&mut self, address: usize, new_size: usize) -> Result<usize, AllocError> {
        let old_size = self.size_of(address)?;
        let new_address = self.allocate(new_size)?;
        // SAFETY: both runs are live and disjoint, and the caller guarantees
        // the region is mapped.
        unsafe {
            raw::memory_copy(
                new_address as *mut u8,
                address as *const u8,
                old_size.min(new_size),
            )
        };
        self.free(address)?;
        Ok(new_address)
    }

    /// Size in bytes of the run starting at `address`.
    pub fn size_of(&self, address: usize) -> Result<usize, AllocError> {
        let index = self.head_index(address)?;
        Ok(self.run_length(index) * PAGE_SIZE)
    }

    /// Pins the run starting at `address` so reclamation never frees it.
    pub fn set_fixed(&mut self, address: usize) -> Result<(), AllocError> {
        let index = self.head_index(address)?;
        self.flags[index] |= PageFlags::FIXED;
        Ok(())
    }

    /// Reclamation flags of the run starting at `address`.
    pub fn flags_of(&self, address: usize) -> Result<PageFlags, AllocError> {
        let index = self.head_index(address)?;
        Ok(self.flags[index])
    }

    /// Number of free pages.
    pub fn free_pages(&self) -> usize {
        self.pages.iter().filter(|p| **p == PageState::Free).count()
    }

    /// Number of allocated pages.
    pub fn used_pages(&self) -> usize {
        N - self.free_pages()
    }

    /// Length in pages of the longest run of free pages.
    pub fn largest_free_run(&self) -> usize {
        let mut best = 0;
        let mut current = 0;
        for page in &self.pages {
            if *page == PageState::Free {
                current += 1;
                best = best.max(current);
            } else {
                current = 0;
            }
        }
        best
    }

    /// Iterates over live runs as `(address, pages)`.
    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter_map(move |(index, page)| match page {
                PageState::Head { pages } => Some((self.address_of(index), *pages as usize)),
                _ => None,
            })
    }

    fn find_run(&self, needed: usize) -> Option<usize> {
        let mut index = 0;
        while index + needed <= N {
            match self.pages[index] {
                PageState::Head { pages } => index += pages as usize,
                PageState::Continuation => index += 1,
                PageState::Free => {
                    match self.pages[index..index + needed]
                        .iter()
                        .position(|p| *p != PageState::Free)
                    {
                        None => return Some(index),
                        Some(taken) => index += taken,
                    }
                }
            }
        }
        None
    }

    pub(super) fn run_length(&self, index: usize) -> usize {
        match self.pages[index] {
            PageState::Head { pages } => pages as usize,
            _ => 0,
        }
    }

    pub(super) fn address_of(&self, index: usize) -> usize {
        self.start + index * PAGE_SIZE
    }

    pub(super) fn head_index(&self, address: usize) -> Result<usize, AllocError> {
        if !self.initialized {
            return Err(AllocError::Uninitialized);
        }
        if address < self.start || address >= self.start + self.size() {
            return Err(AllocError::OutOfRange { address });
        }
        let offset = address - self.start;
        let index = offset / PAGE_SIZE;
        match self.pages[index] {
            PageState::Head { .. } if offset % PAGE_SIZE == 0 => Ok(index),
            _ => Err(AllocError::NotAllocated { address }),
        }
    }
}

impl<const N: usize> Default for PageAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x2000_0000;

    fn allocator<const N: usize>() -> Box<PageAllocator<N>> {
        let mut alloc = Box::new(PageAllocator::<N>::new());
        alloc.initialize(BASE);
        alloc
    }

    #[test]
    fn test_allocate_free_cycle() {
        let mut alloc = allocator::<64>();

        let a = alloc.allocate(4096).unwrap();
        assert_eq!(a, 0x2000_0000);
        let b = alloc.allocate(8192).unwrap();
        assert_eq!(b, 0x2000_1000);

        assert_eq!(alloc.free(a), Ok(4096));
        let c = alloc.allocate(4096).unwrap();
        assert_eq!(c, 0x2000_0000);
    }

    #[test]
    fn test_run_metadata_layout() {
        let mut alloc = allocator::<16>();
        let a = alloc.allocate(3 * PAGE_SIZE - 1).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(alloc.pages[0], PageState::Head { pages: 3 });
        assert_eq!(alloc.pages[1], PageState::Continuation);
        assert_eq!(alloc.pages[2], PageState::Continuation);
        assert_eq!(alloc.pages[3], PageState::Free);
        assert_eq!(alloc.used_pages(), 3);
    }

    #[test]
    fn test_round_trip_restores_metadata() {
        for size in [0, 1, 4095, 4096, 4097, 10_000, 5 * PAGE_SIZE, 31 * PAGE_SIZE] {
            let mut alloc = allocator::<32>();
            // some unrelated live state around the request
            let keep = alloc.allocate(PAGE_SIZE).unwrap();
            alloc.set_fixed(keep).unwrap();

            let pages_before = alloc.pages;
            let flags_before = alloc.flags;

            let address = alloc.allocate(size).unwrap();
            alloc.free(address).unwrap();

            assert_eq!(alloc.pages, pages_before, "size {}", size);
            assert_eq!(alloc.flags, flags_before, "size {}", size);
        }
    }

    #[test]
    fn test_live_allocations_never_overlap() {
        let mut alloc = allocator::<128>();
        let sizes = [4096, 100, 3 * 4096, 9000, 1, 4096 * 7, 20_000];
        let mut live = Vec::new();
        for (round, size) in sizes.iter().cycle().take(20).enumerate() {
            let address = alloc.allocate(*size).unwrap();
            live.push((address, PageAllocator::<128>::pages_for(*size) * PAGE_SIZE));
            if round % 3 == 2 {
                let (victim, _) = live.remove(round % live.len());
                alloc.free(victim).unwrap();
            }
        }

        for (i, (a, a_len)) in live.iter().enumerate() {
            for (b, b_len) in live.iter().skip(i + 1) {
                assert!(a + a_len <= *b || b + b_len <= *a, "{:#x} overlaps {:#x}", a, b);
            }
        }
    }

    #[test]
    fn test_first_fit_is_deterministic() {
        fn run() -> Vec<usize> {
            let mut alloc = allocator::<64>();
            let mut out = Vec::new();
            let a = alloc.allocate(3 * PAGE_SIZE).unwrap();
            let b = alloc.allocate(PAGE_SIZE).unwrap();
            out.push(a);
            out.push(b);
            alloc.free(a).unwrap();
            out.push(alloc.allocate(2 * PAGE_SIZE).unwrap());
            out.push(alloc.allocate(2 * PAGE_SIZE).unwrap());
            out.push(alloc.allocate(1).unwrap());
            out
        }

        let first = run();
        assert_eq!(first, run());
        // the two-page hole left by `a` is reused, the second request skips
        // past `b`, and the single page fills the remaining gap
        assert_eq!(
            first,
            vec![BASE, BASE + 0x3000, BASE, BASE + 0x4000, BASE + 0x2000]
        );
    }

    #[test]
    fn test_zero_size_gets_unique_page() {
        let mut alloc = allocator::<4>();
        let a = alloc.allocate(0).unwrap();
        let b = alloc.allocate(0).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.size_of(a), Ok(PAGE_SIZE));
    }

    #[test]
    fn test_out_of_memory() {
        let mut alloc = allocator::<4>();
        alloc.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(
            alloc.allocate(3 * PAGE_SIZE),
            Err(AllocError::OutOfMemory {
                requested: 3 * PAGE_SIZE
            })
        );
        assert!(alloc.allocate(2 * PAGE_SIZE).is_ok());
        assert!(alloc.allocate(1).is_err());
    }

    #[test]
    fn test_invalid_free_is_rejected() {
        let mut alloc = allocator::<8>();
        let a = alloc.allocate(2 * PAGE_SIZE).unwrap();
        let snapshot = alloc.pages;

        assert_eq!(
            alloc.free(a + PAGE_SIZE),
            Err(AllocError::NotAllocated {
                address: a + PAGE_SIZE
            })
        );
        assert_eq!(
            alloc.free(a + 12),
            Err(AllocError::NotAllocated { address: a + 12 })
        );
        assert_eq!(
            alloc.free(BASE + 8 * PAGE_SIZE),
            Err(AllocError::OutOfRange {
                address: BASE + 8 * PAGE_SIZE
            })
        );
        assert_eq!(alloc.pages, snapshot);

        alloc.free(a).unwrap();
        assert_eq!(alloc.free(a), Err(AllocError::NotAllocated { address: a }));
    }

    #[test]
    fn test_uninitialized_allocator() {
        let mut alloc = Box::new(PageAllocator::<4>::new());
        assert_eq!(alloc.allocate(1), Err(AllocError::Uninitialized));
        assert_eq!(alloc.free(BASE), Err(AllocError::Uninitialized));
    }

    #[test]
    fn test_largest_free_run() {
        let mut alloc = allocator::<10>();
        let a = alloc.allocate(2 * PAGE_SIZE).unwrap();
        alloc.allocate(PAGE_SIZE).unwrap();
        alloc.free(a).unwrap();
        // pages 0-1 free, 2 used, 3-9 free
        assert_eq!(alloc.largest_free_run(), 7);
        assert_eq!(alloc.free_pages(), 9);
    }

    #[test]
    fn test_reallocate_copies_and_moves() {
        const PAGES: usize = 8;
        let mut backing = vec![0u8; (PAGES + 1) * PAGE_SIZE];
        let base = (backing.as_mut_ptr() as usize).next_multiple_of(PAGE_SIZE);

        let mut alloc = Box::new(PageAllocator::<PAGES>::new());
        alloc.initialize(base);

        // SAFETY: the allocator's region lies inside `backing`.
        unsafe {
            let old = alloc.allocate_zeroed(PAGE_SIZE).unwrap();
            for i in 0..PAGE_SIZE {
                *(old as *mut u8).add(i) = (i % 251) as u8;
            }

            let grown = alloc.reallocate(old, 2 * PAGE_SIZE).unwrap();
            assert_ne!(grown, old);
            assert_eq!(alloc.size_of(grown), Ok(2 * PAGE_SIZE));
            assert!(alloc.size_of(old).is_err());
            for i in 0..PAGE_SIZE {
                assert_eq!(*(grown as *const u8).add(i), (i % 251) as u8);
            }

            let same = alloc.reallocate(grown, 2 * PAGE_SIZE).unwrap();
            assert_ne!(same, grown);
            assert_eq!(*(same as *const u8).add(250), 250);
        }
        drop(backing);
    }
}
