//! Threads: a saved frame, a stack and a little scheduling state.

use super::frame::{InterruptFrame, INITIAL_RFLAGS, KERNEL_CS, KERNEL_SS};

/// A stack owned by a thread. Stacks are never returned to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    /// Lowest address of the stack.
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl Stack {
    /// Highest usable address, 16-byte aligned.
    pub fn top(&self) -> usize {
        (self.base + self.size) & !0xF
    }
}

/// One schedulable execution context.
#[derive(Debug, Clone)]
pub struct Thread {
    pub(super) frame: InterruptFrame,
    stack: Option<Stack>,
    pub(super) affinity: u32,
    pub(super) sleep_ticks: u64,
    pub(super) terminated: bool,
    idle: bool,
}

impl Thread {
    /// Creates a thread that runs `entry` on `stack`.
    ///
    /// The first time the thread is scheduled it resumes at `start`, an
    /// `extern "C" fn(fn()) -> !` that calls the entry point it receives in
    /// `rdi` and terminates the thread when it returns. The stack top is offset
    /// by one word so `start` sees the alignment a `call` would have left.
    pub fn new(entry: fn(), stack: Stack, start: usize) -> Self {
        let frame = InterruptFrame {
            rip: start as u64,
            cs: KERNEL_CS,
            rflags: INITIAL_RFLAGS,
            rsp: (stack.top() - 8) as u64,
            ss: KERNEL_SS,
            rdi: entry as usize as u64,
            ..InterruptFrame::default()
        };

        Self {
            frame,
            stack: Some(stack),
            affinity: 0,
            sleep_ticks: 0,
            terminated: false,
            idle: false,
        }
    }

    /// Creates the idle thread of a core.
    ///
    /// The idle thread has no frame or stack of its own: it adopts the context
    /// that initialized the core's scheduler, whose frame is saved into this
    /// slot on the first tick. That context must halt forever.
    pub(super) fn adopted_idle(core: u32) -> Self {
        Self {
            frame: InterruptFrame::default(),
            stack: None,
            affinity: core,
            sleep_ticks: 0,
            terminated: false,
            idle: true,
        }
    }

    /// The stack, if the thread owns one.
    pub fn stack(&self) -> Option<Stack> {
        self.stack
    }

    /// Core the thread runs on.
    pub fn affinity(&self) -> u32 {
        self.affinity
    }

    /// Remaining ticks before the thread may run again.
    pub fn sleep_ticks(&self) -> u64 {
        self.sleep_ticks
    }

    /// Whether the thread has terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether this is a core's idle thread.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// The saved register image.
    pub fn frame(&self) -> &InterruptFrame {
        &self.frame
    }

    pub(super) fn is_eligible(&self, core: u32) -> bool {
        !self.terminated && self.sleep_ticks == 0 && self.affinity == core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() {}

    #[test]
    fn test_initial_frame() {
        let stack = Stack {
            base: 0x2000_0000,
            size: 16384,
        };
        let thread = Thread::new(entry, stack, 0xFFFF_8000_0010_0000);
        let frame = thread.frame();

        assert_eq!(frame.rip, 0xFFFF_8000_0010_0000);
        assert_eq!(frame.cs, 0x08);
        assert_eq!(frame.ss, 0x10);
        assert_eq!(frame.rflags, 0x202);
        assert_eq!(frame.rsp, 0x2000_4000 - 8);
        assert_eq!(frame.rdi, entry as usize as u64);
        assert!(!thread.is_terminated());
        assert_eq!(thread.stack(), Some(stack));
    }

    #[test]
    fn test_stack_top_is_aligned() {
        let stack = Stack {
            base: 0x1003,
            size: 0x100,
        };
        assert_eq!(stack.top(), 0x1100);
    }
}
