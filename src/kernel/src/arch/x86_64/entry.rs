//! Common interrupt entry.
//!
//! Every vector has a 16-byte stub in `kestrel_isr_stubs`. A stub pushes a zero
//! error code when the CPU does not push one, then the vector number, and jumps
//! to `kestrel_isr_common`, which saves the general registers in
//! [`InterruptFrame`] order and hands the frame to [`kestrel_interrupt_entry`].
//! On return the (possibly replaced) frame is restored and `iretq` resumes it.

use super::pic;
use super::serial::EmergencyWriter;
use crate::arch::halt_forever;
use crate::interrupts::{Disposition, ExceptionReport, FIRST_IRQ};
use crate::kernel::kernel;
use crate::sched::InterruptFrame;
use core::fmt::Write;

/// Distance between consecutive vector stubs.
pub const STUB_STRIDE: u64 = 16;

core::arch::global_asm!(
    r#"
    .section .text.kestrel_isr, "ax"
    .p2align 4
    .global kestrel_isr_stubs
kestrel_isr_stubs:
    .set kestrel_vector, 0
    .rept 256
    .p2align 4
    .if (kestrel_vector == 8) || ((kestrel_vector >= 10) && (kestrel_vector <= 14)) || (kestrel_vector == 17) || (kestrel_vector == 21) || (kestrel_vector == 29) || (kestrel_vector == 30)
    .else
    pushq $0
    .endif
    pushq $kestrel_vector
    jmp kestrel_isr_common
    .set kestrel_vector, kestrel_vector + 1
    .endr

kestrel_isr_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %rsp, %rdi
    cld
    call kestrel_interrupt_entry
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq
    .text
    "#,
    options(att_syntax)
);

extern "C" {
    static kestrel_isr_stubs: u8;
}

/// Address of the stub for `vector`.
pub fn stub_address(vector: u8) -> u64 {
    // SAFETY: only the address of the symbol is taken.
    let base = unsafe { core::ptr::addr_of!(kestrel_isr_stubs) } as u64;
    base + u64::from(vector) * STUB_STRIDE
}

fn read_cr2() -> u64 {
    let value: u64;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

#[no_mangle]
extern "C" fn kestrel_interrupt_entry(frame: &mut InterruptFrame) {
    let vector = frame.vector as u8;
    let cr2 = if vector == 14 { read_cr2() } else { 0 };

    let Some(kernel) = kernel() else {
        // Before the kernel context exists only exceptions are possible.
        if vector < FIRST_IRQ {
            let report = ExceptionReport::new(0, frame, cr2);
            let _ = write!(EmergencyWriter::new(), "{}", report);
            halt_forever();
        }
        return;
    };

    match kernel.handle_interrupt(kernel.core_id(), frame, cr2) {
        Disposition::Resume => {
            if pic::is_legacy_device(vector) {
                pic::end_of_interrupt(vector);
            }
        }
        Disposition::Halt => halt_forever(),
        Disposition::Fatal(report) => {
            let mut writer = EmergencyWriter::new();
            let _ = writeln!(writer);
            report.render(&mut writer);
            halt_forever()
        }
    }
}
