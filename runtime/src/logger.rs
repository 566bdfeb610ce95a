//! Runtime logger
//!
//! Installs a `log` backend that writes to stderr and mirrors every line
//! into the recent-log ring used by fault dumps. The level comes from the
//! `POSIXRT_LOG` environment variable (`error`..`trace`, default `warn`).

use std::io::Write;
use std::time::Instant;

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record};

use crate::log_buffer;

/// Environment variable holding the log level
pub const LOG_ENV: &str = "POSIXRT_LOG";

static LOGGER: OnceCell<RuntimeLogger> = OnceCell::uninit();

pub struct RuntimeLogger {
    level: LevelFilter,
    start: Instant,
}

impl RuntimeLogger {
    fn new(level: LevelFilter) -> Self {
        RuntimeLogger {
            level,
            start: Instant::now(),
        }
    }

    fn format(&self, record: &Record) -> String {
        let elapsed = self.start.elapsed();
        let thread = std::thread::current();
        format!(
            "[{:>5}.{:06}] {:<5} {} ({}): {}",
            elapsed.as_secs(),
            elapsed.subsec_micros(),
            record.level(),
            record.target(),
            thread.name().unwrap_or("?"),
            record.args()
        )
    }
}

impl Log for RuntimeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
        log_buffer::capture(line);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Parse a level name; unknown names fall back to `warn`
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Warn,
    }
}

/// Install the logger. Safe to call more than once; only the first call
/// takes effect, and an already-installed foreign logger is left alone.
pub fn init() {
    let level = std::env::var(LOG_ENV)
        .map(|v| parse_level(&v))
        .unwrap_or(LevelFilter::Warn);
    if LOGGER.try_init_once(|| RuntimeLogger::new(level)).is_err() {
        return;
    }
    if let Some(logger) = LOGGER.get() {
        if log::set_logger(logger).is_ok() {
            log::set_max_level(level);
        }
    }
}
