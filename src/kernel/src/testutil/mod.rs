//! Test infrastructure for the Kestrel kernel.
//!
//! Two kinds of tests use this module:
//!
//! - Host unit tests (`cargo test` on the development machine) use [`sim`] to
//!   stand in for the local APIC and to play several cores with OS threads.
//! - Bare-metal tests in `tests/` run under QEMU with the
//!   `custom_test_frameworks` runner below and report through the
//!   `isa-debug-exit` device.
//!
//! ```rust,ignore
//! use kestrel_kernel::testutil::{QemuExitCode, exit_qemu, test_runner, Testable};
//! ```

#[cfg(test)]
pub mod sim;

/// QEMU exit codes for signaling test results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// All tests passed.
    Success = 0x10,
    /// One or more tests failed.
    Failed = 0x11,
}

/// Exit QEMU with the given exit code.
///
/// Uses the isa-debug-exit device configured on port 0xf4.
///
/// # Note
///
/// QEMU must be started with `-device isa-debug-exit,iobase=0xf4,iosize=0x04`.
/// The actual exit code will be `(value << 1) | 1`, so:
/// - `Success` (0x10) → exit code 33
/// - `Failed` (0x11) → exit code 35
#[cfg(target_os = "none")]
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY: Writing to the isa-debug-exit device port is safe when QEMU
    // is configured with this device. It triggers a QEMU exit.
    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}

/// Trait for types that can be run as tests.
pub trait Testable {
    /// Run the test and report results.
    fn run(&self);
}

#[cfg(target_os = "none")]
impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::serial_print!("{} ... ", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}

/// Custom test runner for bare-metal tests.
///
/// Runs all tests and exits QEMU with success if all pass.
///
/// ```rust,ignore
/// #![feature(custom_test_frameworks)]
/// #![test_runner(kestrel_kernel::testutil::test_runner)]
/// ```
#[cfg(target_os = "none")]
pub fn test_runner(tests: &[&dyn Testable]) {
    crate::serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for test binaries.
///
/// Reports test failure and exits QEMU with failure code.
///
/// ```rust,ignore
/// #[panic_handler]
/// fn panic(info: &PanicInfo) -> ! {
///     kestrel_kernel::testutil::test_panic_handler(info)
/// }
/// ```
#[cfg(target_os = "none")]
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    crate::serial_println!("[failed]");
    crate::serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
    crate::arch::halt_loop()
}
