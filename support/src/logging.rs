//! Structured logging, built on `slog` + `sloggers`.
//!
//! Every core component takes a `slog::Logger` and logs with structured
//! key-value pairs rather than formatted strings, the way `flux::logging`
//! and the daemon's `log.c` do.

use serdeconv;
pub use slog::{self, debug, error, info, o, trace, warn, Discard, Logger};
use sloggers::terminal::{Destination as TerminalDestination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Where log records go. Mirrors `daemonlib/log_posix.c`'s destinations
/// (stderr, syslog-like file) collapsed to what `sloggers` ships.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Destination {
    Stderr,
    File,
}

/// Builds the root logger for the daemon from a level and destination.
///
/// `path` is only consulted when `destination == Destination::File`.
pub fn init(level: &str, destination: Destination, path: Option<&str>) -> Logger {
    let toml = match destination {
        Destination::Stderr => format!(
            "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"stderr\"\n",
            level
        ),
        Destination::File => format!(
            "type = \"file\"\nlevel = \"{}\"\npath = \"{}\"\n",
            level,
            path.unwrap_or("bridged.log")
        ),
    };

    match serdeconv::from_toml_str::<LoggerConfig>(&toml).and_then(|config| {
        config
            .build_logger()
            .map_err(|err| serdeconv::Error::from(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))
    }) {
        Ok(logger) => logger,
        Err(_) => {
            let mut builder = TerminalLoggerBuilder::new();
            builder.destination(TerminalDestination::Stderr);
            builder.level(Severity::Debug);
            builder.build().unwrap_or_else(|_| Logger::root(Discard, o!()))
        }
    }
}

/// A logger that discards everything, used for tests and components
/// constructed without an explicit logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
