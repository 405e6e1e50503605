//! Configuration management for procpulse.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// Default configuration constants
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/procpulse";
pub const DEFAULT_WRITE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;

/// Configuration structure merged from file and CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    #[serde(alias = "data-root")]
    pub data_root: Option<PathBuf>,

    // Scheduling
    #[serde(alias = "write-interval-secs")]
    pub write_interval_secs: Option<u64>,
    #[serde(alias = "log-interval-secs")]
    pub log_interval_secs: Option<u64>,
    #[serde(alias = "tick-interval-secs")]
    pub tick_interval_secs: Option<u64>,

    /// Settle delay in milliseconds after counter handle acquisition
    #[serde(alias = "warmup-ms")]
    pub warmup_ms: Option<u64>,

    // Logging
    #[serde(alias = "log-level")]
    pub log_level: Option<String>,

    /// One-shot mode: collect for a single log interval, then exit
    pub once: Option<bool>,

    /// Alternate /proc mount point, mainly for containers
    #[serde(alias = "proc-root")]
    pub proc_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: Some(PathBuf::from(DEFAULT_DATA_ROOT)),
            write_interval_secs: Some(DEFAULT_WRITE_INTERVAL_SECS),
            log_interval_secs: Some(DEFAULT_LOG_INTERVAL_SECS),
            tick_interval_secs: Some(DEFAULT_TICK_INTERVAL_SECS),
            warmup_ms: None,
            log_level: Some("info".into()),
            once: Some(false),
            proc_root: Some(PathBuf::from("/proc")),
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let write = cfg.write_interval_secs.unwrap_or(DEFAULT_WRITE_INTERVAL_SECS);
    let log = cfg.log_interval_secs.unwrap_or(DEFAULT_LOG_INTERVAL_SECS);
    let tick = cfg.tick_interval_secs.unwrap_or(DEFAULT_TICK_INTERVAL_SECS);

    if write == 0 {
        return Err("write_interval_secs must be greater than zero".into());
    }
    if tick == 0 {
        return Err("tick_interval_secs must be greater than zero".into());
    }
    if log < write {
        return Err(format!(
            "log_interval_secs ({}) must not be shorter than write_interval_secs ({})",
            log, write
        )
        .into());
    }
    if tick > write {
        return Err(format!(
            "tick_interval_secs ({}) must not be longer than write_interval_secs ({})",
            tick, write
        )
        .into());
    }

    if let Some(level) = cfg.log_level.as_deref() {
        match level {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(format!(
                    "Invalid log_level '{}', expected off/error/warn/info/debug/trace",
                    other
                )
                .into());
            }
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref().and_then(|p| p.to_str()))?
    };

    if let Some(data_root) = &args.data_root {
        config.data_root = Some(data_root.clone());
    }

    // Only override intervals if the user supplied them on the CLI.
    if args.write_interval.is_some() {
        config.write_interval_secs = args.write_interval;
    }
    if args.log_interval.is_some() {
        config.log_interval_secs = args.log_interval;
    }
    if args.tick_interval.is_some() {
        config.tick_interval_secs = args.tick_interval;
    }

    if args.once {
        config.once = Some(true);
    }

    if let Some(proc_root) = &args.proc_root {
        config.proc_root = Some(proc_root.clone());
    }

    Ok(config)
}

/// Configuration loading with multiple format support
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        // Try default locations
        let defaults = [
            "/etc/procpulse/procpulse.yaml",
            "/etc/procpulse/procpulse.yml",
            "/etc/procpulse/procpulse.json",
            "./procpulse.yaml",
            "./procpulse.yml",
            "./procpulse.json",
        ];

        defaults
            .iter()
            .find(|p| Path::new(p).exists())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(""))
    };

    if !path.exists() || path.to_string_lossy().is_empty() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };

    println!("{output}");
    Ok(())
}
