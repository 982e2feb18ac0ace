/*
 * Kernel Logging
 *
 * Bridges the `log` facade to the serial port. Every subsystem logs through
 * `log::{info, warn, error, debug}!`; the terminal is reserved for output
 * that user space asked for.
 */

use log::{Level, LevelFilter, Metadata, Record};

use crate::serial_println;

struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLog = KernelLog;

/// Install the logger. Panics if called twice.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Info))
        .expect("logger already installed");

    serial_println!("logger initialized");
}
