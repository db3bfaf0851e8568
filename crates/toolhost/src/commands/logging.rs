//! Logging initialization.

use std::io::IsTerminal;
use toolhost_util::{log, LogConfig, LogLevel};

/// Initialize logging on stderr.
///
/// `--verbose` wins over the configured level; without either only warnings
/// are shown.
pub fn init_logging(verbose: bool, configured: Option<LogLevel>) {
    let level = if verbose {
        LogLevel::Debug
    } else {
        configured.unwrap_or_default()
    };
    log::init(LogConfig {
        level,
        include_location: verbose,
        ansi: std::io::stderr().is_terminal(),
    });
}
