//! Kernel logger.
//!
//! Routes the `log` crate's macros to the serial console. The logger itself
//! is a zero-sized static so it can be installed before the heap exists;
//! `serial_println!` remains available for the paths that run even earlier.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial::_print(format_args!(
            "[{}] {}\n",
            record.target().rsplit("::").next().unwrap_or("kernel"),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Called once during early boot.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise or lower the global level at runtime.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
