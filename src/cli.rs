// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `ldapwatchd`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ldapwatchd",
    version,
    about = "Run Ansible playbooks when LDAP entries change.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "ldapwatchd.toml")]
    pub config: String,

    /// Run a single poll cycle, flush pending windows, drain executions, exit.
    ///
    /// Useful for smoke tests and for driving the daemon from cron.
    #[arg(long)]
    pub once: bool,

    /// Parse + validate, print the active rules, but don't poll or execute.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LDAPWATCHD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
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
