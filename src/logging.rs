//! Console logging for hosts embedding the engine.
//!
//! The engine itself only talks to the `log` facade. Hosts that do not bring
//! their own logger can call [`init_logging`].

use env_filter::Builder as EnvFilterBuilder;
use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

// Runtime level cap applied on top of RUST_LOG.
// Stored as the numeric value of `log::LevelFilter`.
static CONSOLE_LOG_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Trace as u8);

fn level_filter_from_u8(value: u8) -> LevelFilter {
    match value {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Parse console logging directives from `RUST_LOG`, falling back to
/// info-level logging when the variable is unset, empty or invalid.
pub fn build_console_filter() -> env_filter::Filter {
    build_filter_from(std::env::var("RUST_LOG").ok().as_deref())
}

fn build_filter_from(spec: Option<&str>) -> env_filter::Filter {
    let mut builder = EnvFilterBuilder::new();

    match spec {
        Some(spec) if !spec.trim().is_empty() => {
            if let Err(err) = builder.try_parse(spec) {
                log::warn!(
                    "Ignoring invalid RUST_LOG value '{}': {}. Falling back to info-level console logging",
                    spec,
                    err
                );
                builder.filter_level(LevelFilter::Info);
            }
        }
        _ => {
            builder.filter_level(LevelFilter::Info);
        }
    }

    builder.build()
}

/// Cap console output at `level` without touching the RUST_LOG directives.
pub fn set_log_level(level: LevelFilter) {
    CONSOLE_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LevelFilter {
    level_filter_from_u8(CONSOLE_LOG_LEVEL.load(Ordering::Relaxed))
}

struct ConsoleLogger {
    filter: env_filter::Filter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log_level() && self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) || !self.filter.matches(record) {
            return;
        }

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "[{} {:<5} {}] {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the console logger.
///
/// `debug` raises the cap to `Debug` regardless of RUST_LOG's default level.
/// Returns an error if a logger was already installed.
pub fn init_logging(debug: bool) -> Result<(), log::SetLoggerError> {
    let filter = if debug {
        let mut builder = EnvFilterBuilder::new();
        builder.filter_level(LevelFilter::Debug);
        if let Ok(spec) = std::env::var("RUST_LOG") {
            if !spec.trim().is_empty() && builder.try_parse(&spec).is_err() {
                builder.filter_level(LevelFilter::Debug);
            }
        }
        builder.build()
    } else {
        build_console_filter()
    };

    let max_level = filter.filter();
    log::set_boxed_logger(Box::new(ConsoleLogger { filter }))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_falls_back_to_info() {
        assert_eq!(build_filter_from(None).filter(), LevelFilter::Info);
        assert_eq!(build_filter_from(Some("   ")).filter(), LevelFilter::Info);
    }

    #[test]
    fn valid_spec_is_honoured() {
        let filter = build_filter_from(Some("mindtype_lib=trace"));
        assert_eq!(filter.filter(), LevelFilter::Trace);
    }

    #[test]
    fn level_cap_round_trips() {
        set_log_level(LevelFilter::Warn);
        assert_eq!(log_level(), LevelFilter::Warn);
        set_log_level(LevelFilter::Trace);
        assert_eq!(log_level(), LevelFilter::Trace);
    }
}
