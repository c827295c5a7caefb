//! Structured logging plumbing. Components take a parent logger and derive
//! children with their own context; anything constructed without a parent
//! falls back to a discard root.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal root logger writing to stderr.
pub fn term_root(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("Terminal logger construction failed")
}

/// Maps the PMIX_DEBUG verbosity integer onto a severity.
pub fn severity_from_verbosity(verbosity: u32) -> Severity {
    match verbosity {
        0 => Severity::Warning,
        1 => Severity::Info,
        2 => Severity::Debug,
        _ => Severity::Trace,
    }
}

/// Logger that swallows everything. Used when no parent is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
