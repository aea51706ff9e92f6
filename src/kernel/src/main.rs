//! Kestrel Kernel Entry Point
//!
//! Boots every core, runs the in-kernel self tests and then leaves a few
//! service threads running: a heartbeat, the keyboard decoder and the page
//! reclaimer.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare_metal {
    use bootloader::{entry_point, BootInfo};
    use core::fmt::Write;
    use core::panic::PanicInfo;
    use core::sync::atomic::{AtomicBool, Ordering};
    use kestrel_hal::{LocalInterruptController, Timer};
    use kestrel_kernel::arch::x86_64::{paging, serial::EmergencyWriter};
    use kestrel_kernel::boot::{self, Status};
    use kestrel_kernel::kernel::kernel;
    use kestrel_kernel::keyboard::{self, KeyDecoder};
    use kestrel_kernel::{allocator, arch, serial_print};
    use pc_keyboard::DecodedKey;

    entry_point!(kernel_main);

    const HEARTBEAT_MS: u64 = 1000;
    const RECLAIM_MS: u64 = 5000;

    /// Kernel entry point.
    ///
    /// Called by the bootloader after setting up the initial environment.
    fn kernel_main(boot_info: &'static BootInfo) -> ! {
        let kernel = boot::init(boot_info);

        kestrel_kernel::tests::run_all(kernel);

        let last_core = kernel.scheduler().inspect(|threads| {
            threads
                .iter()
                .filter(|t| t.is_idle())
                .map(|t| t.affinity())
                .max()
                .unwrap_or(0)
        });
        for (entry, core, name) in [
            (heartbeat as fn(), 0, "heartbeat"),
            (keyboard_decoder as fn(), 0, "keyboard"),
            (reclaimer as fn(), last_core, "reclaim"),
        ] {
            match kernel.spawn(entry, core) {
                Ok(index) => log::info!("{} thread {} on core {}", name, index, core),
                Err(e) => log::error!("{} thread did not start: {}", name, e),
            }
        }

        boot::log(Status::Ok, "Boot complete!");
        // this context is now core 0's idle thread
        arch::halt_loop()
    }

    fn heartbeat() {
        let Some(kernel) = kernel() else { return };
        loop {
            log::info!(
                "uptime {} ms, {} threads, {} switches, {} free pages, {} KiB heap in use",
                kernel.ticks().current_ticks() * 1000 / u64::from(kernel.config().timer_hz),
                kernel.scheduler().thread_count(),
                kernel.scheduler().switches(),
                kernel.free_pages(),
                allocator::used() / 1024
            );
            kernel.sleep(HEARTBEAT_MS);
        }
    }

    fn keyboard_decoder() {
        let Some(kernel) = kernel() else { return };
        let mut decoder = KeyDecoder::new();
        loop {
            while let Some(scancode) = keyboard::pop_scancode() {
                match decoder.decode(scancode) {
                    Some(DecodedKey::Unicode(c)) => serial_print!("{}", c),
                    Some(DecodedKey::RawKey(key)) => log::debug!("key {:?}", key),
                    None => {}
                }
            }
            kernel.sleep(10);
        }
    }

    fn reclaimer() {
        let Some(kernel) = kernel() else { return };
        loop {
            kernel.sleep(RECLAIM_MS);
            kernel.reclaim(paging::take_accessed);
        }
    }

    static PANICKING: AtomicBool = AtomicBool::new(false);

    /// Panic handler.
    ///
    /// Stops every other core, prints the message with a fresh serial writer
    /// and halts.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::disable_interrupts();
        if PANICKING.swap(true, Ordering::SeqCst) {
            arch::halt_forever();
        }
        let core = kernel().map(|kernel| {
            kernel.halt_system();
            kernel.lapic().id()
        });

        let mut writer = EmergencyWriter::new();
        let _ = match core {
            Some(core) => writeln!(writer, "\nKERNEL PANIC on CPU{}: {}", core, info),
            None => writeln!(writer, "\nKERNEL PANIC: {}", info),
        };
        arch::halt_forever()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
