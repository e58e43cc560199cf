use crate::qemu_trace;
use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing to the QEMU debug console.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Install this logger. Call once during early init.
    ///
    /// # Errors
    /// If a logger has already been installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        qemu_trace!("[{}] {}: {}\n", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Format `record` the way [`QemuLogger`] emits it.
///
/// # Errors
/// Whatever `w` reports.
pub fn write_record<W: fmt::Write>(w: &mut W, record: &Record) -> fmt::Result {
    writeln!(w, "[{}] {}: {}", record.level(), record.target(), record.args())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn filters_by_level() {
        let logger = QemuLogger::new(LevelFilter::Info);
        let info = Metadata::builder().level(Level::Info).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn formats_level_target_and_message() {
        let mut out = String::new();
        let page = 0x0040_0000;
        write_record(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .target("kernel_vmem::address_space")
                .args(format_args!("mapping {page:#010x} failed"))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN] kernel_vmem::address_space: mapping 0x00400000 failed\n");
    }
}
