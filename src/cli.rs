// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `ingestflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ingestflow",
    version,
    about = "Schedule graph ingestion work for source changes across a worker pool.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML). Defaults apply if it does not exist.
    #[arg(long, value_name = "PATH", default_value = "Ingestflow.toml")]
    pub config: String,

    /// Process the current input, then exit once everything is drained.
    #[arg(long)]
    pub once: bool,

    /// Read newline-delimited JSON change events from FILE instead of
    /// watching the filesystem.
    #[arg(long, value_name = "FILE")]
    pub events: Option<PathBuf>,

    /// Request an embedding for every ingested file.
    #[arg(long)]
    pub embed: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `INGESTFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config and print it, without running anything.
    #[arg(long)]
    pub dry_run: bool,
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
