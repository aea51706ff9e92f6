//! Start code for secondary cores.
//!
//! A woken core begins in real mode at `TRAMPOLINE_PHYS`. The blob below moves
//! it through protected mode into long mode with the boot core's page tables,
//! loads the boot core's GDT and IDT from the mailbox, picks its stack slot by
//! initial APIC id and calls the mailbox entry point with that id.

use super::gdt;
use crate::arch::{enable_interrupts, halt_loop};
use crate::config::{MAILBOX_PHYS, TRAMPOLINE_PHYS, TRAMPOLINE_SIZE};
use crate::kernel::kernel;
use crate::smp::Mailbox;

// The blob hardcodes both addresses.
const _: () = assert!(TRAMPOLINE_PHYS == 0x6_0000 && MAILBOX_PHYS == 0x5_0000);

core::arch::global_asm!(
    r#"
    .section .text.kestrel_trampoline, "ax"
    .set TRAMPOLINE, 0x60000
    .set MAILBOX, 0x50000

    .code16
    .global kestrel_trampoline_start
kestrel_trampoline_start:
    cli
    cld
    movw %cs, %ax
    movw %ax, %ds
    lgdtl tr_gdt_pointer - kestrel_trampoline_start
    movl %cr0, %eax
    orl $0x1, %eax
    movl %eax, %cr0
    ljmpl $0x08, $(TRAMPOLINE + (tr_protected - kestrel_trampoline_start))

    .code32
tr_protected:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    # PAE, OSFXSR, OSXMMEXCPT
    movl $0x620, %eax
    movl %eax, %cr4
    movl MAILBOX + 0x30, %eax
    movl %eax, %cr3
    # EFER: LME and NXE
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x900, %eax
    wrmsr
    # PG, WP, MP and PE
    movl %cr0, %eax
    andl $0xFFFFFFFB, %eax
    orl $0x80010003, %eax
    movl %eax, %cr0
    ljmpl $0x18, $(TRAMPOLINE + (tr_long - kestrel_trampoline_start))

    .code64
tr_long:
    movq MAILBOX + 0x20, %rax
    lgdt (%rax)
    movq MAILBOX + 0x28, %rax
    lidt (%rax)
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    xorw %ax, %ax
    movw %ax, %fs
    movw %ax, %gs

    movl $1, %eax
    cpuid
    shrl $24, %ebx
    movl %ebx, %edi
    leaq 1(%rdi), %rax
    imulq MAILBOX + 0x18, %rax
    addq MAILBOX + 0x10, %rax
    andq $-16, %rax
    movq %rax, %rsp

    pushq $0x08
    leaq tr_reload(%rip), %rax
    pushq %rax
    lretq
tr_reload:
    xorl %ebp, %ebp
    movq MAILBOX + 0x08, %rax
    callq *%rax
tr_halt:
    cli
    hlt
    jmp tr_halt

    .p2align 3
tr_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A000000FFFF
tr_gdt_end:
tr_gdt_pointer:
    .word tr_gdt_end - tr_gdt - 1
    .long TRAMPOLINE + (tr_gdt - kestrel_trampoline_start)
    .global kestrel_trampoline_end
kestrel_trampoline_end:
    .text
    "#,
    options(att_syntax)
);

extern "C" {
    static kestrel_trampoline_start: u8;
    static kestrel_trampoline_end: u8;
}

/// The bring-up mailbox at its identity-mapped physical address.
// SAFETY: the mailbox page is identity-mapped and reserved before bring-up.
pub static MAILBOX: Mailbox = unsafe { Mailbox::new(MAILBOX_PHYS as *mut u8) };

/// The trampoline machine code.
pub fn blob() -> &'static [u8] {
    // SAFETY: both symbols delimit the blob inside the kernel image.
    unsafe {
        let start = core::ptr::addr_of!(kestrel_trampoline_start);
        let end = core::ptr::addr_of!(kestrel_trampoline_end);
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

/// Copies the trampoline to its physical page and returns the STARTUP page
/// number.
///
/// # Safety
///
/// The trampoline page must be identity-mapped, writable and unused.
pub unsafe fn install() -> u8 {
    let code = blob();
    assert!(
        code.len() <= TRAMPOLINE_SIZE,
        "trampoline is {} bytes, only {} reserved",
        code.len(),
        TRAMPOLINE_SIZE
    );
    // SAFETY: upheld by the caller; the length was checked above.
    unsafe {
        crate::memory::raw::memory_copy(TRAMPOLINE_PHYS as *mut u8, code.as_ptr(), code.len());
    }
    (TRAMPOLINE_PHYS >> 12) as u8
}

/// Rust entry of every secondary core, called by the trampoline.
pub extern "C" fn secondary_main(apic_id: u32) -> ! {
    let Some(kernel) = kernel() else {
        halt_loop();
    };
    gdt::init_secondary();
    kernel.lapic().enable(false);
    match kernel.enter_secondary(&MAILBOX) {
        Ok(core) => log::debug!("smp: core {} (APIC {}) idle", core, apic_id),
        Err(e) => panic!("{}", e),
    }
    enable_interrupts();
    halt_loop()
}
