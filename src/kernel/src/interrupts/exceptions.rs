//! CPU exception diagnostics.

use crate::sched::InterruptFrame;
use core::fmt::{self, Write};
use kestrel_hal::Console;

/// Human readable name of exception `vector`.
///
/// A page fault whose address lies in the first pages of memory is reported as
/// a null pointer dereference.
pub fn describe(vector: u8, cr2: u64) -> &'static str {
    match vector {
        0 => "DIVIDE BY ZERO",
        1 => "SINGLE STEP",
        2 => "NMI",
        3 => "BREAKPOINT",
        4 => "OVERFLOW",
        5 => "BOUNDS CHECK",
        6 => "INVALID OPCODE",
        7 => "COPR UNAVAILABLE",
        8 => "DOUBLE FAULT",
        9 => "COPR SEGMENT OVERRUN",
        10 => "INVALID TSS",
        11 => "SEGMENT NOT FOUND",
        12 => "STACK EXCEPTION",
        13 => "GENERAL PROTECTION",
        14 if (cr2 >> 5) < 0x1000 => "NULL POINTER",
        14 => "PAGE FAULT",
        16 => "COPR ERROR",
        _ => "UNKNOWN",
    }
}

/// Everything printed about a fatal exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionReport {
    /// Core the exception was raised on.
    pub core: u32,
    /// Exception vector.
    pub vector: u8,
    /// Error code pushed by the CPU, zero when the vector has none.
    pub error_code: u64,
    /// Faulting address for page faults.
    pub cr2: u64,
    /// Instruction pointer.
    pub rip: u64,
    /// Code segment.
    pub cs: u64,
    /// Flags register.
    pub rflags: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Stack segment.
    pub ss: u64,
}

impl ExceptionReport {
    /// Captures the report for the exception described by `frame`.
    pub fn new(core: u32, frame: &InterruptFrame, cr2: u64) -> Self {
        Self {
            core,
            vector: frame.vector as u8,
            error_code: frame.error_code,
            cr2,
            rip: frame.rip,
            cs: frame.cs,
            rflags: frame.rflags,
            rsp: frame.rsp,
            ss: frame.ss,
        }
    }

    /// Name of the exception.
    pub fn description(&self) -> &'static str {
        describe(self.vector, self.cr2)
    }

    /// Writes the report to `console`.
    pub fn render(&self, console: &mut dyn Console) {
        // console writes never fail
        let _ = write!(ConsoleWriter(console), "{}", self);
    }
}

impl fmt::Display for ExceptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kernel panic on CPU{}", self.core)?;
        writeln!(f, "RIP: {:#x}", self.rip)?;
        writeln!(f, "Code Segment: {:#x}", self.cs)?;
        writeln!(f, "RFlags: {:#x}", self.rflags)?;
        writeln!(f, "RSP: {:#x}", self.rsp)?;
        writeln!(f, "Stack Segment: {:#x}", self.ss)?;
        if self.error_code != 0 {
            writeln!(f, "Error Code: {:#x}", self.error_code)?;
        }
        if self.vector == 14 {
            writeln!(f, "Fault Address: {:#x}", self.cr2)?;
        }
        writeln!(f, "Description: {}", self.description())
    }
}

struct ConsoleWriter<'a>(&'a mut dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Captured(String);

    impl Console for Captured {
        fn write_str(&mut self, s: &str) {
            self.0.push_str(s);
        }

        fn clear(&mut self) {
            self.0.clear();
        }
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(describe(0, 0), "DIVIDE BY ZERO");
        assert_eq!(describe(13, 0), "GENERAL PROTECTION");
        assert_eq!(describe(14, 0x10), "NULL POINTER");
        assert_eq!(describe(14, 0xFFFF_8000_0000_0000), "PAGE FAULT");
        assert_eq!(describe(15, 0), "UNKNOWN");
        assert_eq!(describe(21, 0), "UNKNOWN");
    }

    #[test]
    fn test_report_renders_to_console() {
        let mut frame = InterruptFrame::for_vector(14);
        frame.rip = 0x1234;
        frame.error_code = 2;
        let report = ExceptionReport::new(1, &frame, 0xDEAD_0000);

        let mut console = Captured::default();
        report.render(&mut console);
        assert!(console.0.starts_with("Kernel panic on CPU1\n"));
        assert!(console.0.contains("RIP: 0x1234\n"));
        assert!(console.0.contains("Error Code: 0x2\n"));
        assert!(console.0.contains("Fault Address: 0xdead0000\n"));
        assert!(console.0.ends_with("Description: PAGE FAULT\n"));
    }
}
