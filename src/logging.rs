//! Subscriber setup. The level comes from `--log-level`, then
//! `BACKUP_CONSOLE_LOG`, then defaults to info.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

/// Install the global subscriber on stderr
///
/// Colours are only used on a terminal: the scheduled runner's stderr lands in
/// the job log the status page shows.
pub fn init_logging(cli_level: Option<LogLevel>) {
    let level = resolve_level(cli_level, std::env::var("BACKUP_CONSOLE_LOG").ok().as_deref());

    fmt()
        .with_max_level(level)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_level(cli_level: Option<LogLevel>, env_level: Option<&str>) -> Level {
    match cli_level {
        Some(LogLevel::Error) => Level::ERROR,
        Some(LogLevel::Warn) => Level::WARN,
        Some(LogLevel::Info) => Level::INFO,
        Some(LogLevel::Debug) => Level::DEBUG,
        Some(LogLevel::Trace) => Level::TRACE,
        None => env_level
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(Level::INFO),
    }
}
