// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `svcflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "svcflow",
    version,
    about = "Run configured services as dependency-ordered, throttled jobs.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Svcflow.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Svcflow.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SVCFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the services, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Submit services as one chain in dependency order instead of wiring
    /// their `after` lists.
    #[arg(long)]
    pub chain: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
