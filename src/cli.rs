//! CLI arguments for procpulse.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags and options.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "procpulse",
    about = "Per-process telemetry collector with windowed flushes and usage reports",
    long_about = "Per-process telemetry collector with windowed flushes and usage reports.\n\n\
                  Samples CPU, memory, disk, and network counters for a single process, \
                  flushes windowed samples to durable JSON files, and periodically folds \
                  them into aggregated usage reports.",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    /// Pid of the process to monitor
    pub pid: Option<u32>,

    /// Owner label for directories and file names (defaults to the image name)
    #[arg(short = 'w', long)]
    pub owner: Option<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Root directory for window files and reports
    #[arg(short = 'd', long)]
    pub data_root: Option<PathBuf>,

    /// Cache window length in seconds
    #[arg(long)]
    pub write_interval: Option<u64>,

    /// Aggregation interval in seconds
    #[arg(long)]
    pub log_interval: Option<u64>,

    /// Sampling tick in seconds
    #[arg(long)]
    pub tick_interval: Option<u64>,

    /// Collect for a single log interval, write directly to the archive, then exit
    #[arg(long)]
    pub once: bool,

    /// Resume window boundaries from this time (RFC 3339) after a restart
    #[arg(long)]
    pub resume_from: Option<String>,

    /// Alternate /proc mount point
    #[arg(long)]
    pub proc_root: Option<PathBuf>,
}
