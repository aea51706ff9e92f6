//! Kestrel Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines the boundaries between the kernel core and the hardware
//! or driver code it talks to. The core only ever sees these traits, which is
//! what lets the scheduler, the interrupt dispatcher and the bring-up protocol
//! run against simulated hardware in host tests.

#![no_std]

/// Per-core local interrupt controller (the x86 Local APIC).
///
/// Every method acts on the controller of the core that calls it, so
/// implementations take `&self` and are shared between all cores.
pub trait LocalInterruptController: Sync {
    /// Returns the hardware id of the calling core.
    fn id(&self) -> u32;

    /// Sends a fixed interrupt with `vector` to the core with hardware id `target`.
    ///
    /// Returns once the local controller has accepted the request, not once
    /// the remote core has handled it.
    fn send_interrupt(&self, target: u32, vector: u8);

    /// Broadcasts `vector` to every core except the caller.
    fn send_all_excluding_self(&self, vector: u8);

    /// Broadcasts `vector` to every core including the caller.
    fn send_all_including_self(&self, vector: u8);

    /// Sends an INIT inter-processor interrupt to `target`.
    fn send_init(&self, target: u32);

    /// Sends a STARTUP inter-processor interrupt to `target`.
    ///
    /// `page` is the physical page number (address >> 12) of the code the
    /// woken core starts executing in real mode.
    fn send_startup(&self, target: u32, page: u8);

    /// Acknowledges the interrupt currently being serviced.
    fn end_of_interrupt(&self);

    /// Starts the periodic local timer.
    ///
    /// `initial_count` is the countdown value reloaded after every expiry and
    /// `vector` is the interrupt raised on each expiry.
    fn start_timer(&self, initial_count: u32, vector: u8);

    /// Stops the local timer.
    fn stop_timer(&self);
}

/// Trait for a text-based console output.
///
/// Writes are best effort; implementations swallow failures.
pub trait Console {
    /// Writes a string to the console.
    fn write_str(&mut self, s: &str);
    /// Clears the console screen.
    fn clear(&mut self);
}

/// Trait for a system timer.
pub trait Timer {
    /// Returns the number of ticks since the system started.
    fn current_ticks(&self) -> u64;
}

/// A sector-addressed storage device.
pub trait BlockDevice {
    /// Size of one sector in bytes.
    const SECTOR_SIZE: usize = 512;

    /// Reads `count` sectors starting at `sector` into `buffer`.
    ///
    /// `buffer` must be at least `count * SECTOR_SIZE` bytes long.
    fn read(&mut self, sector: u64, count: u32, buffer: &mut [u8]) -> bool;

    /// Writes `count` sectors starting at `sector` from `buffer`.
    fn write(&mut self, sector: u64, count: u32, buffer: &[u8]) -> bool;
}

/// A network interface card driven by interrupts.
pub trait NetworkDevice: Send {
    /// The legacy IRQ line this device raises.
    fn irq(&self) -> u8;

    /// Services the device after its IRQ fired. Runs in interrupt context and
    /// must not block.
    fn on_interrupt(&mut self);

    /// Queues `data` for transmission.
    fn send(&mut self, data: &[u8]);

    /// Hardware address of the interface.
    fn mac_address(&self) -> [u8; 6];
}

/// Platform description supplied by firmware tables.
pub trait Platform {
    /// Hardware ids of every enabled logical core, in table order.
    fn core_ids(&self) -> &[u32];

    /// Physical base address of the local interrupt controller registers.
    fn local_apic_base(&self) -> u64;
}
