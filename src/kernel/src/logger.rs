//! Serial backend for the `log` facade.
//!
//! Every record goes to COM1 as `[LEVEL cpuN] target: message`. The core id is
//! only known once the kernel context exists; earlier records show `cpu?`.

use crate::serial_println;
use kestrel_hal::LocalInterruptController;
use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match crate::kernel::kernel() {
            Some(kernel) => serial_println!(
                "[{:<5} cpu{}] {}: {}",
                record.level(),
                kernel.lapic().id(),
                record.target(),
                record.args()
            ),
            None => serial_println!(
                "[{:<5} cpu?] {}: {}",
                record.level(),
                record.target(),
                record.args()
            ),
        }
    }

    fn flush(&self) {}
}

/// Installs the serial logger. Later calls only change the level.
pub fn init(level: LevelFilter) {
    // a second install fails harmlessly
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
