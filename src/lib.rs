//! Procpulse Per-Process Telemetry Library
//!
//! This library samples resource counters for a single monitored process,
//! flushes windowed samples to durable JSON files, and folds finished windows
//! into aggregated usage reports. It is runtime-agnostic: the binary drives a
//! [`monitor::ProcessMonitor`] from an async tick loop, but the library itself
//! uses no async and can be driven from plain threads or tests.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use procpulse::counters::proc::{ProcCounterSource, ProcDirectory};
//! use procpulse::counters::{CounterSource, ProcessDirectory, ProcessIdentity};
//! use procpulse::aggregate::TracingSink;
//! use procpulse::monitor::{MonitorSettings, ProcessMonitor, RunMode};
//! use procpulse::resolver::HandleResolver;
//!
//! let source: Arc<dyn CounterSource> = Arc::new(ProcCounterSource::new());
//! let directory: Arc<dyn ProcessDirectory> = Arc::new(ProcDirectory::new());
//! let sink = Arc::new(TracingSink);
//!
//! let resolver = HandleResolver::new(Arc::clone(&source), directory, sink.clone(), 1234);
//! let settings = MonitorSettings {
//!     data_root: "/var/lib/procpulse".into(),
//!     write_interval: chrono::Duration::seconds(60),
//!     log_interval: chrono::Duration::seconds(600),
//!     mode: RunMode::Service,
//! };
//!
//! let mut monitor = ProcessMonitor::new(
//!     ProcessIdentity::new(1234, "myapp"),
//!     settings,
//!     resolver,
//!     source,
//!     sink,
//!     None,
//!     Vec::new(),
//! );
//!
//! loop {
//!     monitor.tick(chrono::Utc::now());
//!     if monitor.finished() {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! ```

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod counters;
pub mod monitor;
pub mod resolver;
pub mod sample;
pub mod window;

// Re-export main types for convenience
pub use counters::ProcessIdentity;
pub use monitor::{MonitorSettings, ProcessMonitor, RunMode};
pub use resolver::HandleResolver;
pub use sample::DataPoint;
