//! x86_64 architecture support.
//!
//! - `serial`: COM1 output, print macros and the panic-time writer
//! - `gdt`: descriptor table and double-fault stack
//! - `idt`, `entry`: the interrupt descriptor table and the common entry stub
//! - `lapic`, `pic`: interrupt controllers
//! - `acpi`: core discovery from the MADT
//! - `paging`: identity mappings and accessed-bit scanning
//! - `trampoline`: the real-mode start code for secondary cores

pub mod acpi;
#[cfg(target_os = "none")]
pub mod entry;
#[cfg(target_os = "none")]
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
#[cfg(target_os = "none")]
pub mod lapic;
#[cfg(target_os = "none")]
pub mod paging;
#[cfg(target_os = "none")]
pub mod pic;
#[cfg(target_os = "none")]
pub mod serial;
#[cfg(target_os = "none")]
pub mod trampoline;

/// Halts the CPU until the next interrupt.
///
/// Used in idle loops to reduce power consumption.
#[inline]
pub fn hlt() {
    #[cfg(target_os = "none")]
    x86_64::instructions::hlt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Halts the CPU in an infinite loop.
///
/// Interrupts stay enabled, so timer ticks keep being serviced.
pub fn halt_loop() -> ! {
    loop {
        hlt();
    }
}

/// Disables interrupts and halts this core for good.
pub fn halt_forever() -> ! {
    disable_interrupts();
    halt_loop()
}

/// Runs `f` with interrupts disabled on this core, restoring the previous
/// state afterwards.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}

/// Masks interrupts on this core.
#[inline]
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}

/// Unmasks interrupts on this core.
#[inline]
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}
