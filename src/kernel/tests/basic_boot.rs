#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kestrel_kernel::testutil::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec::Vec;
use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use kestrel_hal::{LocalInterruptController, Timer};
use kestrel_kernel::config::PAGE_SIZE;
use kestrel_kernel::kernel::{kernel, Kernel};
use kestrel_kernel::arch::x86_64::lapic::LocalApic;
use kestrel_kernel::arch::x86_64::{gdt, trampoline};
use kestrel_kernel::testutil::{exit_qemu, QemuExitCode};

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    kestrel_kernel::boot::init(boot_info);
    test_main();
    exit_qemu(QemuExitCode::Success);
    kestrel_kernel::arch::halt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kestrel_kernel::testutil::test_panic_handler(info)
}

fn installed() -> &'static Kernel<LocalApic> {
    kernel().expect("kernel not installed")
}

#[test_case]
fn boot_core_is_core_zero() {
    assert_eq!(installed().lapic().id(), 0);
}

#[test_case]
fn every_core_has_an_idle_thread() {
    let idle = installed()
        .scheduler()
        .inspect(|threads| threads.iter().filter(|t| t.is_idle()).count());
    assert!(idle >= 1);
}

#[test_case]
fn every_core_loaded_its_own_tss() {
    assert_eq!(
        gdt::cores_with_tss(),
        u32::from(trampoline::MAILBOX.activated())
    );
}

#[test_case]
fn heap_allocation_works() {
    let v: Vec<u64> = (0..1000).collect();
    assert_eq!(v.iter().sum::<u64>(), 999 * 1000 / 2);
}

#[test_case]
fn page_allocations_do_not_overlap() {
    let kernel = installed();
    let a = kernel.allocate(PAGE_SIZE);
    let b = kernel.allocate(2 * PAGE_SIZE);
    assert!(b >= a + PAGE_SIZE || a >= b + 2 * PAGE_SIZE);
    kernel.free(a);
    kernel.free(b);
}

#[test_case]
fn timer_ticks_advance() {
    let kernel = installed();
    let before = kernel.ticks().current_ticks();
    kernel.wait(5);
    assert!(kernel.ticks().current_ticks() >= before + 5);
}
