//! Generational reclamation of page runs.
//!
//! Each scan asks whether a run was touched since the previous scan. Touched
//! runs start over at age zero, untouched ones age by one, and a run whose age
//! overflows into [`PageFlags::NEEDS_COLLECT`] is freed. Runs marked
//! [`PageFlags::FIXED`] are skipped.

use super::page_alloc::{PageAllocator, PageState};
use crate::config::PAGE_SIZE;
use kestrel_common::PageFlags;

/// Outcome of one reclamation scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reclaimed {
    /// Runs released.
    pub runs: usize,
    /// Bytes released.
    pub bytes: usize,
}

impl<const N: usize> PageAllocator<N> {
    /// Ages every unpinned run and frees the ones that aged out.
    ///
    /// `accessed(address, pages)` reports whether the run was touched since
    /// the last scan and clears that record.
    pub fn reclaim(&mut self, mut accessed: impl FnMut(usize, usize) -> bool) -> Reclaimed {
        let mut reclaimed = Reclaimed::default();
        let mut index = 0;
        while index < N {
            let pages = match self.pages[index] {
                PageState::Head { pages } => pages as usize,
                _ => {
                    index += 1;
                    continue;
                }
            };

            let flags = self.flags[index];
            if !flags.contains(PageFlags::FIXED) {
                let address = self.address_of(index);
                self.flags[index] = if accessed(address, pages) {
                    flags.with_age(0)
                } else {
                    flags.with_age(flags.age() + 1)
                };

                if self.flags[index].contains(PageFlags::NEEDS_COLLECT) {
                    for page in &mut self.pages[index..index + pages] {
                        *page = PageState::Free;
                    }
                    self.flags[index] = PageFlags::empty();
                    reclaimed.runs += 1;
                    reclaimed.bytes += pages * PAGE_SIZE;
                }
            }
            index += pages;
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x2000_0000;

    #[test]
    fn test_untouched_runs_age_out() {
        let mut alloc = Box::new(PageAllocator::<16>::new());
        alloc.initialize(BASE);
        let hot = alloc.allocate(PAGE_SIZE).unwrap();
        let cold = alloc.allocate(2 * PAGE_SIZE).unwrap();
        let pinned = alloc.allocate(PAGE_SIZE).unwrap();
        alloc.set_fixed(pinned).unwrap();

        let scans = PageFlags::AGE.bits() as usize;
        for _ in 0..scans {
            let result = alloc.reclaim(|address, _| address == hot);
            assert_eq!(result, Reclaimed::default());
        }
        assert_eq!(alloc.flags_of(cold).unwrap().age(), PageFlags::AGE.bits());
        assert_eq!(alloc.flags_of(hot).unwrap().age(), 0);

        let result = alloc.reclaim(|address, _| address == hot);
        assert_eq!(
            result,
            Reclaimed {
                runs: 1,
                bytes: 2 * PAGE_SIZE
            }
        );
        assert!(alloc.size_of(cold).is_err());
        assert!(alloc.size_of(hot).is_ok());
        assert!(alloc.size_of(pinned).is_ok());
        assert_eq!(alloc.flags_of(pinned).unwrap().age(), 0);
    }

    #[test]
    fn test_access_resets_age() {
        let mut alloc = Box::new(PageAllocator::<4>::new());
        alloc.initialize(BASE);
        let run = alloc.allocate(PAGE_SIZE).unwrap();

        alloc.reclaim(|_, _| false);
        alloc.reclaim(|_, _| false);
        assert_eq!(alloc.flags_of(run).unwrap().age(), 2);

        let mut asked = Vec::new();
        alloc.reclaim(|address, pages| {
            asked.push((address, pages));
            true
        });
        assert_eq!(asked, vec![(run, 1)]);
        assert_eq!(alloc.flags_of(run).unwrap().age(), 0);
    }
}
