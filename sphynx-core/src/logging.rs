//! Thin wrapper around `slog`/`sloggers`, following `flux::logging`'s setup.
//!
//! The core never reaches for a process-wide logging singleton: every subsystem is handed a
//! `slog::Logger` through the `Context` it is constructed with (see `config`). This module only
//! supplies the default terminal logger `sphynx-server` installs at startup.

pub use slog::{debug, error, info, o, trace, warn, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Build a terminal logger at the given severity. Used by binaries; library code should accept
/// a `Logger` rather than calling this.
pub fn init_terminal(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("logger configuration is always valid")
}

/// A logger that discards everything, for tests and embedders who don't want console output.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
