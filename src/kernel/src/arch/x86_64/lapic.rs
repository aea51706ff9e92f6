//! Local APIC driver.
//!
//! Every core sees its own controller at the same address, so one
//! [`LocalApic`] value serves all of them. The register page must be mapped
//! uncached before use (see `paging::map_mmio`).

use crate::arch::without_interrupts;
use crate::interrupts::SPURIOUS_VECTOR;
use crate::sync::spin_until;
use kestrel_common::SpinTimeout;
use kestrel_hal::LocalInterruptController;
use x86_64::instructions::port::Port;

const ID: u64 = 0x020;
const TPR: u64 = 0x080;
const EOI: u64 = 0x0B0;
const SVR: u64 = 0x0F0;
const ICR_LOW: u64 = 0x300;
const ICR_HIGH: u64 = 0x310;
const LVT_TIMER: u64 = 0x320;
const LVT_LINT0: u64 = 0x350;
const LVT_LINT1: u64 = 0x360;
const TIMER_INITIAL: u64 = 0x380;
const TIMER_CURRENT: u64 = 0x390;
const TIMER_DIVIDE: u64 = 0x3E0;

const SVR_ENABLE: u32 = 0x100;
const ICR_SEND_PENDING: u32 = 0x1000;
const ICR_ASSERT: u32 = 0x4000;
const ICR_INIT: u32 = 0x0500;
const ICR_STARTUP: u32 = 0x0600;
const ICR_ALL_INCLUDING_SELF: u32 = 0x8_0000;
const ICR_ALL_EXCLUDING_SELF: u32 = 0xC_0000;
const LVT_MASKED: u32 = 0x1_0000;
const LVT_PERIODIC: u32 = 0x2_0000;
const LVT_EXTINT: u32 = 0x700;
const LVT_NMI: u32 = 0x400;
const DIVIDE_BY_16: u32 = 0x3;

/// PIT input clock in Hz.
const PIT_HZ: u64 = 1_193_182;
/// Length of the calibration window.
const CALIBRATION_MS: u64 = 10;

/// Memory-mapped Local APIC.
pub struct LocalApic {
    base: u64,
    spin_limit: u64,
}

impl LocalApic {
    /// Wraps the register page mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must map the local APIC registers uncached for as long as the
    /// value is used.
    pub const unsafe fn new(base: u64, spin_limit: u64) -> Self {
        Self { base, spin_limit }
    }

    fn read(&self, register: u64) -> u32 {
        // SAFETY: `new` guarantees the register page is mapped.
        unsafe { core::ptr::read_volatile((self.base + register) as *const u32) }
    }

    fn write(&self, register: u64, value: u32) {
        // SAFETY: `new` guarantees the register page is mapped.
        unsafe { core::ptr::write_volatile((self.base + register) as *mut u32, value) }
    }

    /// Software-enables the calling core's APIC with the spurious vector and
    /// accepts every priority. On the boot core `external` routes the legacy
    /// PICs in through LINT0.
    pub fn enable(&self, external: bool) {
        self.write(SVR, SVR_ENABLE | u32::from(SPURIOUS_VECTOR));
        self.write(TPR, 0);
        if external {
            self.write(LVT_LINT0, LVT_EXTINT);
            self.write(LVT_LINT1, LVT_NMI);
        } else {
            self.write(LVT_LINT0, LVT_MASKED);
            self.write(LVT_LINT1, LVT_MASKED);
        }
    }

    /// Measures the timer against PIT channel 2 and returns the initial count
    /// that gives `hz` expiries per second.
    pub fn calibrate(&self, hz: u32) -> Result<u32, SpinTimeout> {
        let mut gate = Port::<u8>::new(0x61);
        let mut command = Port::<u8>::new(0x43);
        let mut channel2 = Port::<u8>::new(0x42);
        let reload = (PIT_HZ * CALIBRATION_MS / 1000) as u16;

        self.write(TIMER_DIVIDE, DIVIDE_BY_16);
        self.write(LVT_TIMER, LVT_MASKED);

        // SAFETY: ports 0x42, 0x43 and 0x61 belong to the PIT and the speaker
        // gate; channel 2 is not used for anything else.
        let elapsed = unsafe {
            // gate on, speaker off
            let value = gate.read();
            gate.write((value & 0xFD) | 0x01);
            // channel 2, lobyte/hibyte, one-shot
            command.write(0xB2);
            channel2.write(reload as u8);
            channel2.write((reload >> 8) as u8);
            // restart the count
            let value = gate.read();
            gate.write(value & 0xFE);
            gate.write(value | 0x01);

            self.write(TIMER_INITIAL, u32::MAX);
            spin_until(self.spin_limit, "PIT calibration window", || {
                gate.read() & 0x20 != 0
            })?;
            let elapsed = u32::MAX - self.read(TIMER_CURRENT);
            self.write(TIMER_INITIAL, 0);
            elapsed
        };

        let per_second = u64::from(elapsed) * 1000 / CALIBRATION_MS;
        let count = (per_second / u64::from(hz.max(1))).clamp(1, u64::from(u32::MAX)) as u32;
        log::debug!(
            "lapic: {} timer ticks per {} ms, initial count {}",
            elapsed,
            CALIBRATION_MS,
            count
        );
        Ok(count)
    }

    fn send(&self, target: u32, command: u32) {
        without_interrupts(|| {
            self.write(ICR_HIGH, target << 24);
            self.write(ICR_LOW, command);
            if let Err(e) = spin_until(self.spin_limit, "IPI delivery", || {
                self.read(ICR_LOW) & ICR_SEND_PENDING == 0
            }) {
                panic!("lapic: {}", e);
            }
        });
    }
}

impl LocalInterruptController for LocalApic {
    fn id(&self) -> u32 {
        self.read(ID) >> 24
    }

    fn send_interrupt(&self, target: u32, vector: u8) {
        self.send(target, ICR_ASSERT | u32::from(vector));
    }

    fn send_all_excluding_self(&self, vector: u8) {
        self.send(0, ICR_ALL_EXCLUDING_SELF | ICR_ASSERT | u32::from(vector));
    }

    fn send_all_including_self(&self, vector: u8) {
        self.send(0, ICR_ALL_INCLUDING_SELF | ICR_ASSERT | u32::from(vector));
    }

    fn send_init(&self, target: u32) {
        self.send(target, ICR_INIT | ICR_ASSERT);
    }

    fn send_startup(&self, target: u32, page: u8) {
        self.send(target, ICR_STARTUP | ICR_ASSERT | u32::from(page));
    }

    fn end_of_interrupt(&self) {
        self.write(EOI, 0);
    }

    fn start_timer(&self, initial_count: u32, vector: u8) {
        self.write(TIMER_DIVIDE, DIVIDE_BY_16);
        self.write(LVT_TIMER, LVT_PERIODIC | u32::from(vector));
        self.write(TIMER_INITIAL, initial_count);
    }

    fn stop_timer(&self) {
        self.write(LVT_TIMER, LVT_PERIODIC | LVT_MASKED);
        self.write(TIMER_INITIAL, 0);
    }
}
