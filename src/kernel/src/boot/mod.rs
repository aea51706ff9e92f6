//! Boot sequence and boot logging.
//!
//! Boot progress is printed as Linux-style status lines on the serial port.
//! [`init`] brings the machine from the bootloader hand-off to a running
//! scheduler on every core.

use crate::arch::x86_64::acpi::{self, PlatformInfo};
use crate::arch::x86_64::lapic::LocalApic;
use crate::arch::x86_64::{gdt, idt, paging, pic, serial, trampoline};
use crate::arch::{enable_interrupts, without_interrupts};
use crate::config::{
    KernelConfig, MAILBOX_PHYS, PAGE_SIZE, REGION_BASE, REGION_PAGES, REGION_SIZE,
    TRAMPOLINE_PHYS,
};
use crate::interrupts::{KEYBOARD_VECTOR, MOUSE_VECTOR, FIRST_IRQ};
use crate::kernel::{self, thread_start, Kernel};
use crate::memory::frames::{self, BootInfoFrameAllocator};
use crate::memory::PageAllocator;
use crate::smp::BootData;
use crate::{allocator, keyboard, logger, serial_println};
use bootloader::BootInfo;
use kestrel_hal::Platform;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

/// Boot status indicators.
#[derive(Debug, Clone, Copy)]
pub enum Status {
    /// Success - `[ OK ]`
    Ok,
    /// Failure - `[FAIL]`
    Fail,
    /// Warning - `[WARN]`
    Warn,
    /// Informational - `[INFO]`
    Info,
}

impl Status {
    fn tag(self) -> &'static str {
        match self {
            Status::Ok => "[ OK ]",
            Status::Fail => "[FAIL]",
            Status::Warn => "[WARN]",
            Status::Info => "[INFO]",
        }
    }
}

/// Log a boot stage with status.
///
/// Format: `[ OK ] Message text`
pub fn log(status: Status, message: &str) {
    serial_println!("{} {}", status.tag(), message);
}

/// Log an indented detail line (for sub-items).
pub fn log_detail(message: &str) {
    serial_println!("       {}", message);
}

/// Log a section header.
pub fn log_section(name: &str) {
    serial_println!();
    serial_println!("── {} ──", name);
}

static PAGES: Mutex<PageAllocator<REGION_PAGES>> = Mutex::new(PageAllocator::new());

const IA32_APIC_BASE: u32 = 0x1B;
const PS2_DATA: u16 = 0x60;

fn on_keyboard() {
    // SAFETY: reading the PS/2 data port acknowledges the byte.
    let scancode = unsafe { Port::<u8>::new(PS2_DATA).read() };
    if !keyboard::add_scancode(scancode) {
        log::warn!("keyboard: scancode queue full, dropped {:#x}", scancode);
    }
}

fn on_mouse() {
    // SAFETY: see `on_keyboard`. Mouse packets are not decoded.
    let _ = unsafe { Port::<u8>::new(PS2_DATA).read() };
}

fn discover_platform(physical_memory_offset: u64) -> PlatformInfo {
    // SAFETY: the bootloader maps all physical memory at the offset.
    if let Some(info) = unsafe { acpi::discover(physical_memory_offset) } {
        if !info.cores.is_empty() {
            return info;
        }
    }
    // SAFETY: IA32_APIC_BASE exists on every x86_64 processor.
    let msr = unsafe { Msr::new(IA32_APIC_BASE).read() };
    let base = msr & 0xF_FFFF_F000;
    log(Status::Warn, "No MADT found, continuing with one core");
    // SAFETY: CPUID leaf 1 is always available; EBX[31:24] is the APIC id.
    let id = unsafe { core::arch::x86_64::__cpuid(1) }.ebx >> 24;
    PlatformInfo::single_core(id, if base == 0 { acpi::DEFAULT_LAPIC_BASE } else { base })
}

/// Brings up the machine and returns the installed kernel context.
///
/// On return interrupts are enabled on every core and the calling context is
/// the boot core's idle thread.
pub fn init(boot_info: &'static BootInfo) -> &'static Kernel<LocalApic> {
    let config = KernelConfig::DEFAULT;
    serial::init();
    logger::init(config.log_level);
    log_section("Kestrel");

    gdt::init();
    idt::init();
    log(Status::Ok, "GDT and IDT loaded");

    let offset = boot_info.physical_memory_offset;
    let region = REGION_BASE as u64..(REGION_BASE + REGION_SIZE) as u64;
    assert!(
        frames::is_usable(&boot_info.memory_map, region.clone()),
        "page region {:#x}..{:#x} is not backed by usable RAM",
        region.start,
        region.end
    );

    // SAFETY: the bootloader maps all physical memory at `offset` and this is
    // the only call.
    unsafe { paging::init(VirtAddr::new(offset)) };
    // SAFETY: the memory map comes from the bootloader.
    let mut frames = unsafe { BootInfoFrameAllocator::init(&boot_info.memory_map, region.clone()) };
    let data = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let mmio = data | PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH;
    paging::identity_map(region.start, REGION_SIZE as u64, data, &mut frames)
        .expect("identity mapping of the page region failed");
    paging::identity_map(MAILBOX_PHYS, PAGE_SIZE as u64, data, &mut frames)
        .expect("identity mapping of the mailbox failed");
    paging::identity_map(TRAMPOLINE_PHYS, PAGE_SIZE as u64, data, &mut frames)
        .expect("identity mapping of the trampoline failed");
    log(Status::Ok, "Page region identity-mapped");

    without_interrupts(|| PAGES.lock().initialize(REGION_BASE));
    let heap = allocator::init_heap(&PAGES, config.heap_size).expect("heap initialization failed");
    log(Status::Ok, "Page allocator and kernel heap ready");
    log_detail(&alloc::format!(
        "{} pages at {:#x}, {} KiB heap at {:#x}",
        REGION_PAGES,
        REGION_BASE,
        config.heap_size / 1024,
        heap
    ));

    let platform = discover_platform(offset);
    paging::identity_map(platform.local_apic_base(), PAGE_SIZE as u64, mmio, &mut frames)
        .expect("mapping the local APIC failed");
    log(Status::Ok, "Platform discovered");
    log_detail(&alloc::format!(
        "{} cores, local APIC at {:#x}",
        platform.core_ids().len(),
        platform.local_apic_base()
    ));

    // SAFETY: the register page was mapped uncached above.
    let lapic = unsafe { LocalApic::new(platform.local_apic_base(), config.spin_limit) };
    let kernel = kernel::install(|| Kernel::new(config, &PAGES, lapic, thread_start as usize));

    pic::init();
    kernel.lapic().enable(true);
    keyboard::init();
    kernel.register_irq(KEYBOARD_VECTOR - FIRST_IRQ, on_keyboard);
    kernel.register_irq(MOUSE_VECTOR - FIRST_IRQ, on_mouse);
    log(Status::Ok, "Interrupt controllers configured");

    let cores = platform.core_ids();
    if kernel.core_id() != cores.first().copied().unwrap_or(0) {
        log(Status::Info, "Boot core is not listed first in the MADT");
    }
    kernel.start_scheduler(cores).expect("scheduler start failed");
    let count = kernel
        .lapic()
        .calibrate(config.timer_hz)
        .expect("local APIC timer calibration failed");
    kernel.start_timer(count);
    log(Status::Ok, "Scheduler started");
    log_detail(&alloc::format!(
        "{} Hz tick, initial count {}",
        config.timer_hz,
        count
    ));

    // SAFETY: the trampoline page was identity-mapped above and is reserved.
    let page = unsafe { trampoline::install() };
    let boot = BootData {
        entry: trampoline::secondary_main as usize as u64,
        gdt: gdt::pointer_address(),
        idt: idt::pointer_address(),
        page_table: paging::page_table_root(),
        ..BootData::default()
    };
    let started = kernel
        .bring_up_secondaries(&trampoline::MAILBOX, boot, cores, page)
        .expect("secondary core bring-up failed");
    log(Status::Ok, "Secondary cores online");
    log_detail(&alloc::format!("{} of {} cores", started + 1, cores.len()));

    enable_interrupts();
    kernel
}
