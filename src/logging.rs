// src/logging.rs

//! Logging setup for `svcflow` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `SVCFLOW_LOG` environment variable, either a plain level ("debug") or
//!    full filter directives ("svcflow::exec=debug,info")
//! 3. default to `info`
//!
//! Logs are sent to STDERR so that stdout stays free for the run summary.

use anyhow::{Result, anyhow};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "SVCFLOW_LOG";

/// Initialise the global logging subscriber. Fails if one is already set.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = resolve_filter(cli_level, std::env::var(LOG_ENV).ok().as_deref());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing tracing subscriber: {e}"))
}

fn level_filter(level: tracing::Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

fn resolve_filter(cli_level: Option<LogLevel>, env_value: Option<&str>) -> EnvFilter {
    if let Some(lvl) = cli_level {
        return level_filter(level_from_log_level(lvl));
    }
    env_value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| match parse_level_str(s) {
            Some(level) => Some(level_filter(level)),
            None => EnvFilter::try_new(s).ok(),
        })
        .unwrap_or_else(|| level_filter(tracing::Level::INFO))
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(filter: EnvFilter) -> Option<LevelFilter> {
        filter.max_level_hint()
    }

    #[test]
    fn cli_flag_wins_over_env() {
        assert_eq!(
            hint(resolve_filter(Some(LogLevel::Trace), Some("error"))),
            Some(LevelFilter::TRACE)
        );
    }

    #[test]
    fn env_accepts_levels_and_directives() {
        assert_eq!(hint(resolve_filter(None, Some("Warning"))), Some(LevelFilter::WARN));
        assert_eq!(
            hint(resolve_filter(None, Some("svcflow::exec=debug"))),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(hint(resolve_filter(None, Some("  "))), Some(LevelFilter::INFO));
        assert_eq!(hint(resolve_filter(None, None)), Some(LevelFilter::INFO));
    }
}
