//! procpulse - version 0.1.0
//!
//! Per-process telemetry collector with tracing logging.
//! This is the main entry point that resolves configuration and drives the
//! sampling tick loop until the monitored process exits or a signal arrives.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::signal;
use tracing::{info, Level};

use procpulse::aggregate::TracingSink;
use procpulse::cli::{Args, LogLevel};
use procpulse::config::{
    resolve_config, show_config, validate_effective_config, Config, DEFAULT_DATA_ROOT,
    DEFAULT_LOG_INTERVAL_SECS, DEFAULT_TICK_INTERVAL_SECS, DEFAULT_WRITE_INTERVAL_SECS,
};
use procpulse::counters::proc::{ProcCounterSource, ProcDirectory};
use procpulse::counters::{CounterSource, ProcessDirectory};
use procpulse::monitor::{MonitorSettings, ProcessMonitor, RunMode};
use procpulse::resolver::HandleResolver;
use procpulse::window::scan_pending;
use procpulse::ProcessIdentity;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(_config: &Config, args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", args.log_level);
}

/// Parses the optional restart recovery time (RFC 3339).
fn parse_resume(arg: Option<&str>) -> anyhow::Result<Option<DateTime<Utc>>> {
    match arg {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid --resume-from value '{}'", raw))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

/// Resolves until either SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Main application entry point.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format.clone());
    }

    let config = resolve_config(&args)?;

    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config, &args);

    let pid = match args.pid {
        Some(pid) => pid,
        None => {
            eprintln!("❌ No pid given. Usage: procpulse <PID>");
            std::process::exit(1);
        }
    };

    info!("Starting procpulse for pid {}", pid);

    let proc_root = config
        .proc_root
        .clone()
        .unwrap_or_else(|| "/proc".into());
    let source: Arc<dyn CounterSource> = Arc::new(ProcCounterSource::for_root(proc_root.clone()));
    let directory: Arc<dyn ProcessDirectory> = Arc::new(ProcDirectory::for_root(proc_root));

    // Owner label falls back to the image name of the monitored process
    let owner = match args.owner.clone().or_else(|| directory.image_name(pid)) {
        Some(owner) => owner,
        None => {
            eprintln!("❌ Pid {} not found and no --owner given", pid);
            std::process::exit(1);
        }
    };
    let identity = ProcessIdentity::new(pid, owner);

    let data_root = config
        .data_root
        .clone()
        .unwrap_or_else(|| DEFAULT_DATA_ROOT.into());
    let mode = if config.once.unwrap_or(false) {
        RunMode::Command
    } else {
        RunMode::Service
    };
    let settings = MonitorSettings {
        data_root: data_root.clone(),
        write_interval: chrono::Duration::seconds(
            config
                .write_interval_secs
                .unwrap_or(DEFAULT_WRITE_INTERVAL_SECS) as i64,
        ),
        log_interval: chrono::Duration::seconds(
            config.log_interval_secs.unwrap_or(DEFAULT_LOG_INTERVAL_SECS) as i64,
        ),
        mode,
    };

    // Window files a previous run flushed but never aggregated
    let recovered = if mode == RunMode::Service {
        scan_pending(&data_root.join(&identity.owner))
    } else {
        Vec::new()
    };
    let resume_from = parse_resume(args.resume_from.as_deref())?;

    let sink = Arc::new(TracingSink);
    let mut resolver = HandleResolver::new(
        Arc::clone(&source),
        Arc::clone(&directory),
        sink.clone(),
        pid,
    );
    if let Some(ms) = config.warmup_ms {
        resolver = resolver.with_warmup(StdDuration::from_millis(ms));
    }

    let mut monitor = ProcessMonitor::new(
        identity,
        settings,
        resolver,
        source,
        sink,
        resume_from,
        recovered,
    );

    let tick = StdDuration::from_secs(
        config
            .tick_interval_secs
            .unwrap_or(DEFAULT_TICK_INTERVAL_SECS),
    );
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                monitor.tick(now);

                // One-shot mode stops after its single log interval
                if mode == RunMode::Command && now >= monitor.log_window().1 {
                    monitor.finish_monitoring(Utc::now());
                }

                if monitor.finished() {
                    break;
                }
            }
            _ = &mut shutdown => {
                monitor.finish_monitoring(Utc::now());
                break;
            }
        }
    }

    info!("procpulse stopped gracefully");
    Ok(())
}
