//! Saved CPU state of an interrupted context.

/// Kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data/stack segment selector.
pub const KERNEL_SS: u64 = 0x10;
/// RFLAGS for a fresh thread: interrupts enabled plus the reserved bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Register image pushed by the interrupt entry stubs.
///
/// The field order mirrors the stack layout: general purpose registers in the
/// reverse of their push order, then the vector and error code pushed by the
/// stub, then the frame the CPU pushed itself. Scheduling replaces the whole
/// image, so `iretq` resumes whichever thread was copied in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Frame for an interrupt with `vector` and no other state, used by tests
    /// and simulated interrupts.
    pub fn for_vector(vector: u8) -> Self {
        Self {
            vector: u64::from(vector),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_entry_stub() {
        assert_eq!(core::mem::size_of::<InterruptFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, ss), 21 * 8);
    }
}
