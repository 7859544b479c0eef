//! Logging module.

use std::io::{self, Write};

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Logger {
    level: Level,
    stream: Stream,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let target = record.target();

            let message = format!(
                "{:<5} {:<10} {}",
                record.level(),
                target.cyan(),
                record.args()
            );

            let message = format!(
                "{} {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                message,
            );

            let message = match record.level() {
                Level::Error => message.red(),
                Level::Warn => message.yellow(),
                Level::Info => message.normal(),
                Level::Debug => message.dimmed(),
                Level::Trace => message.white().dimmed(),
            };

            match self.stream {
                Stream::Stdout => writeln!(io::stdout(), "{message}").ok(),
                Stream::Stderr => writeln!(io::stderr(), "{message}").ok(),
            };
        }
    }

    fn flush(&self) {}
}

/// Initialize a new logger writing to standard output.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    set(Logger {
        level,
        stream: Stream::Stdout,
    })
}

/// Initialize a new logger writing to standard error. Used by child
/// worker processes, whose standard output carries the parse protocol.
pub fn init_stderr(level: Level) -> Result<(), SetLoggerError> {
    set(Logger {
        level,
        stream: Stream::Stderr,
    })
}

fn set(logger: Logger) -> Result<(), SetLoggerError> {
    let level = logger.level;

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// Get the level set by the environment, if present. `PIPES_LOG_LEVEL`
/// takes precedence over `RUST_LOG`.
pub fn env_level() -> Option<Level> {
    for var in ["PIPES_LOG_LEVEL", "RUST_LOG"] {
        if let Some(level) = std::env::var(var).ok().and_then(|l| l.parse().ok()) {
            return Some(level);
        }
    }
    None
}
