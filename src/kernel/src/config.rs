//! Kernel configuration.
//!
//! Layout constants are fixed at compile time because the boot trampoline and
//! the firmware memory map depend on them. Tunables live in [`KernelConfig`].

/// Allocation granularity of the page allocator.
pub const PAGE_SIZE: usize = 4096;

/// Physical base of the page allocator's region.
pub const REGION_BASE: usize = 0x2000_0000;

/// Size of the page allocator's region.
pub const REGION_SIZE: usize = 64 * 1024 * 1024;

/// Number of pages in the region.
pub const REGION_PAGES: usize = REGION_SIZE / PAGE_SIZE;

/// Physical address of the bring-up mailbox.
pub const MAILBOX_PHYS: u64 = 0x5_0000;

/// Physical address the boot trampoline is copied to.
pub const TRAMPOLINE_PHYS: u64 = 0x6_0000;

/// Size of the boot trampoline blob.
pub const TRAMPOLINE_SIZE: usize = 512;

/// Logical id of the bootstrap core.
pub const BOOT_CORE: u32 = 0;

/// Runtime tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Local timer frequency in Hz. One scheduler tick per period.
    pub timer_hz: u32,
    /// Stack size of every spawned thread.
    pub thread_stack_size: usize,
    /// Boot stack size of every secondary core.
    pub secondary_stack_size: usize,
    /// Size of the `alloc` heap carved from the page region.
    pub heap_size: usize,
    /// Iteration bound for every busy-wait before it is treated as a hang.
    pub spin_limit: u64,
    /// Maximum level the serial logger emits.
    pub log_level: log::LevelFilter,
}

impl KernelConfig {
    /// Configuration used by the bootable kernel.
    pub const DEFAULT: Self = Self {
        timer_hz: 1000,
        thread_stack_size: 16 * 1024,
        secondary_stack_size: 1024 * 1024,
        heap_size: 4 * 1024 * 1024,
        spin_limit: 1 << 32,
        log_level: if cfg!(feature = "verbose") {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        },
    };

    /// Converts milliseconds to scheduler ticks, rounding up.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        ms.saturating_mul(u64::from(self.timer_hz)).div_ceil(1000)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
