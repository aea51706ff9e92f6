//! Serial port driver for x86_64.
//!
//! COM1 (0x3F8) carries everything the kernel prints: log records, boot
//! status lines and panic reports.

use core::fmt::{self, Write};
use kestrel_hal::Console;
use spin::Mutex;
use uart_16550::SerialPort;

/// COM1 I/O port address.
const COM1_PORT: u16 = 0x3F8;

/// Global serial port instance, lazily initialized.
///
/// Take the lock with interrupts disabled: a timer tick that logs while the
/// interrupted code holds it would deadlock the core.
pub static SERIAL: spin::Once<Mutex<SerialPort>> = spin::Once::new();

/// Initializes the global serial port.
///
/// Idempotent; calls after the first have no effect.
pub fn init() {
    serial();
}

fn serial() -> &'static Mutex<SerialPort> {
    SERIAL.call_once(|| {
        // SAFETY: COM1_PORT (0x3F8) is the standard first serial port and the
        // kernel runs with full I/O port access.
        let mut serial = unsafe { SerialPort::new(COM1_PORT) };
        serial.init();
        Mutex::new(serial)
    })
}

/// Prints to the serial port without a newline.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::_print(format_args!($($arg)*))
    };
}

/// Prints to the serial port with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)))
}

/// Internal print function used by macros.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    crate::arch::without_interrupts(|| {
        // serial writes cannot fail
        let _ = serial().lock().write_fmt(args);
    });
}

/// Unlocked COM1 writer for the panic path.
///
/// A halted core may have died holding [`SERIAL`], so fatal reports write
/// through a second handle on the same port. Output from two cores may
/// interleave; nothing else is running by then.
pub struct EmergencyWriter {
    port: SerialPort,
}

impl EmergencyWriter {
    /// Opens COM1 without touching the shared instance.
    pub fn new() -> Self {
        // SAFETY: see `init`. The port was initialized during boot, or is
        // initialized here with the same settings.
        let mut port = unsafe { SerialPort::new(COM1_PORT) };
        if SERIAL.get().is_none() {
            port.init();
        }
        Self { port }
    }
}

impl Default for EmergencyWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for EmergencyWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.port.write_str(s)
    }
}

impl Console for EmergencyWriter {
    fn write_str(&mut self, s: &str) {
        let _ = Write::write_str(self, s);
    }

    fn clear(&mut self) {
        // VT100 erase display, cursor home
        let _ = Write::write_str(self, "\x1b[2J\x1b[H");
    }
}
