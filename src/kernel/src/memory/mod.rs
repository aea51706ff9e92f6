//! Physical memory management.
//!
//! - `page_alloc`: first-fit allocator over the fixed page region
//! - `reclaim`: generational reclamation of unpinned runs
//! - `raw`: byte copy and zero-fill primitives
//! - `frames`: boot-time frame allocator for page tables (bare metal only)

pub mod page_alloc;
pub mod raw;
pub mod reclaim;

#[cfg(target_os = "none")]
pub mod frames;

pub use page_alloc::{PageAllocator, PageState};
pub use reclaim::Reclaimed;
