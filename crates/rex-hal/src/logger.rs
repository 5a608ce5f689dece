//! `log` facade backend that forwards records to the HAL debug output
//!
//! The kernel crates log through the `log` macros; this module installs the
//! single global logger once the HAL is up. Lines look like
//! `[DEBUG rex_kernel_core::process] process 3 created`.

use alloc::format;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::{HalError, HAL};

/// Destination for formatted log lines
pub trait DebugSink: Send + Sync {
    fn write_line(&self, line: &str);
}

impl<H: HAL> DebugSink for H {
    fn write_line(&self, line: &str) {
        self.debug_write(line);
    }
}

/// Global logger writing through a `DebugSink`
pub struct HalLogger {
    sink: Once<&'static dyn DebugSink>,
}

static LOGGER: HalLogger = HalLogger { sink: Once::new() };

impl Log for HalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sink.is_completed() && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            sink.write_line(&format!(
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the global logger.
///
/// Fails with `AlreadyInitialized` on the second call; the first sink wins.
pub fn init_logger(sink: &'static dyn DebugSink, level: LevelFilter) -> Result<(), HalError> {
    let mut installed = false;
    LOGGER.sink.call_once(|| {
        installed = true;
        sink
    });
    if !installed {
        return Err(HalError::AlreadyInitialized);
    }
    log::set_logger(&LOGGER).map_err(|_| HalError::AlreadyInitialized)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestHal;
    use alloc::boxed::Box;

    #[test]
    fn test_logger_forwards_to_debug_write() {
        let hal: &'static TestHal = Box::leak(Box::new(TestHal::new()));
        init_logger(hal, LevelFilter::Debug).unwrap();

        log::info!(target: "rex_test", "pool {} ready", 1);
        log::trace!(target: "rex_test", "filtered out");

        let lines = hal.debug_log();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], "[INFO  rex_test] pool 1 ready");

        // Second installation is rejected
        let other: &'static TestHal = Box::leak(Box::new(TestHal::new()));
        assert_eq!(
            init_logger(other, LevelFilter::Trace),
            Err(HalError::AlreadyInitialized)
        );
    }
}
