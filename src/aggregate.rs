//! Aggregation of flushed window files into summary reports.
//!
//! One aggregation pass deserializes every pending window file, folds all
//! samples into sum/min/max accumulators per metric and per remote endpoint,
//! emits one formatted report to the report sink, and archives each processed
//! file. A parse failure aborts the whole pass before any archiving, leaving
//! the files on disk for manual inspection.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};

use crate::counters::ProcessIdentity;
use crate::sample::{DataPoint, EndpointMap};

/// Category code for a periodic usage report entry.
pub const REPORT_EVENT_ID: u32 = 3001;
/// Category code for the final entry when monitoring finishes.
pub const FINISH_EVENT_ID: u32 = 3002;
/// Category code for an aborted aggregation pass.
pub const AGGREGATION_ERROR_EVENT_ID: u32 = 3003;
/// Category code for a degraded exit-watcher warning.
pub const WATCHER_WARNING_EVENT_ID: u32 = 3004;

/// Severity of a report sink entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

/// The external operational log that receives formatted reports.
pub trait ReportSink: Send + Sync {
    fn emit(&self, severity: Severity, event_id: u32, message: &str);
}

/// Production sink: writes report entries through the tracing subscriber.
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, severity: Severity, event_id: u32, message: &str) {
        match severity {
            Severity::Info => info!(event_id, "{}", message),
            Severity::Warning => warn!(event_id, "{}", message),
        }
    }
}

/// In-memory sink capturing entries, for tests and embedders.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(Severity, u32, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Severity, u32, String)> {
        self.entries.lock().expect("sink lock poisoned").clone()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, severity: Severity, event_id: u32, message: &str) {
        self.entries
            .lock()
            .expect("sink lock poisoned")
            .push((severity, event_id, message.to_string()));
    }
}

/// Errors that abort an aggregation pass.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Running sum/min/max over the observations of one metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricAccumulator {
    sum: f64,
    min: f64,
    max: f64,
    seen: u64,
}

impl MetricAccumulator {
    pub fn record(&mut self, value: f64) {
        if self.seen == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.seen += 1;
    }

    pub fn record_opt(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.record(v);
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Arithmetic mean over `count` samples; zero when the pass saw none.
    pub fn average(&self, count: u64) -> f64 {
        if count == 0 {
            0.0
        } else {
            self.sum / count as f64
        }
    }

    /// Mean over this metric's own observation count.
    pub fn mean(&self) -> f64 {
        self.average(self.seen)
    }
}

/// Per remote-endpoint rollup, rebuilt fresh on every aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct TcpConnectionData {
    pub host: String,
    pub sent: MetricAccumulator,
    pub received: MetricAccumulator,
}

/// Accumulators for every metric carried by a sample.
#[derive(Debug, Default)]
pub struct UsageTotals {
    pub samples: u64,
    pub cpu: MetricAccumulator,
    pub priv_bytes: MetricAccumulator,
    pub working_bytes: MetricAccumulator,
    pub disk_bytes_read: MetricAccumulator,
    pub disk_bytes_write: MetricAccumulator,
    pub disk_ops_read: MetricAccumulator,
    pub disk_ops_write: MetricAccumulator,
    pub udp_sent: MetricAccumulator,
    pub udp_recv: MetricAccumulator,
    pub tcp_sent: MetricAccumulator,
    pub tcp_recv: MetricAccumulator,
    /// Keyed by remote endpoint; ordered so reports are deterministic.
    pub connections: BTreeMap<String, TcpConnectionData>,
}

impl UsageTotals {
    pub fn fold(&mut self, point: &DataPoint) {
        self.samples += 1;
        self.cpu.record_opt(point.cpu_val);
        self.priv_bytes.record_opt(point.priv_bytes_val);
        self.working_bytes.record_opt(point.working_bytes_val);
        self.disk_bytes_read
            .record_opt(point.disk_bytes_read_val.map(|v| v as f64));
        self.disk_bytes_write
            .record_opt(point.disk_bytes_write_val.map(|v| v as f64));
        self.disk_ops_read
            .record_opt(point.disk_ops_read_val.map(|v| v as f64));
        self.disk_ops_write
            .record_opt(point.disk_ops_write_val.map(|v| v as f64));
        self.udp_sent.record_opt(point.udp_sent.map(|v| v as f64));
        self.udp_recv.record_opt(point.udp_recv.map(|v| v as f64));
        self.tcp_sent.record_opt(point.tcp_sent.map(|v| v as f64));
        self.tcp_recv.record_opt(point.tcp_recv.map(|v| v as f64));

        self.fold_connections(&point.connections_sent, true);
        self.fold_connections(&point.connections_received, false);
    }

    fn fold_connections(&mut self, observations: &EndpointMap, sent: bool) {
        for (endpoint, bytes) in observations {
            let entry = self
                .connections
                .entry(endpoint.clone())
                .or_insert_with(|| TcpConnectionData {
                    host: host_label(endpoint),
                    ..Default::default()
                });
            if sent {
                entry.sent.record(*bytes as f64);
            } else {
                entry.received.record(*bytes as f64);
            }
        }
    }
}

/// Host label for an endpoint key: the address portion without the port.
pub fn host_label(endpoint: &str) -> String {
    match endpoint.rsplit_once(':') {
        Some((host, _port)) => host.trim_matches(|c| c == '[' || c == ']').to_string(),
        None => endpoint.to_string(),
    }
}

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, Copy)]
pub struct PassSummary {
    pub samples: u64,
    pub files: usize,
    pub archived: usize,
}

/// Runs one aggregation pass over the given window files.
///
/// All files are parsed before anything else happens; a read or parse error
/// aborts the pass with nothing archived. A pass over zero files still emits
/// a (degenerate) report, which is how a final pass with no pending data
/// behaves.
pub fn run_pass(
    files: &[PathBuf],
    identity: &ProcessIdentity,
    archive_dir: &Path,
    sink: &dyn ReportSink,
) -> Result<PassSummary, AggregateError> {
    let mut batches: Vec<Vec<DataPoint>> = Vec::with_capacity(files.len());
    for path in files {
        let content = fs::read_to_string(path).map_err(|source| AggregateError::Read {
            path: path.clone(),
            source,
        })?;
        let points: Vec<DataPoint> =
            serde_json::from_str(&content).map_err(|source| AggregateError::Parse {
                path: path.clone(),
                source,
            })?;
        batches.push(points);
    }

    let mut totals = UsageTotals::default();
    for batch in &batches {
        for point in batch {
            totals.fold(point);
        }
    }

    let report = format_report(identity, &totals, files.len());
    sink.emit(Severity::Info, REPORT_EVENT_ID, &report);

    let mut archived = 0;
    for path in files {
        // Command mode flushes straight into the archive directory
        if path.parent() == Some(archive_dir) {
            archived += 1;
            continue;
        }
        if let Err(e) = archive_file(path, archive_dir) {
            warn!("could not archive {}: {}", path.display(), e);
            continue;
        }
        archived += 1;
    }

    Ok(PassSummary {
        samples: totals.samples,
        files: files.len(),
        archived,
    })
}

fn archive_file(path: &Path, archive_dir: &Path) -> Result<(), std::io::Error> {
    fs::create_dir_all(archive_dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("window file has no name"))?;
    fs::rename(path, archive_dir.join(file_name))
}

/// Formats the textual usage report for one aggregation pass.
pub fn format_report(identity: &ProcessIdentity, totals: &UsageTotals, files: usize) -> String {
    let count = totals.samples;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Resource usage report for {}: {} samples from {} window files",
        identity, count, files
    );

    let _ = writeln!(out, "{}", gauge_line("cpu percent", &totals.cpu, count));
    let _ = writeln!(
        out,
        "{}",
        gauge_line("private bytes", &totals.priv_bytes, count)
    );
    let _ = writeln!(
        out,
        "{}",
        gauge_line("working set bytes", &totals.working_bytes, count)
    );
    let _ = writeln!(
        out,
        "{}",
        total_line("disk read bytes", &totals.disk_bytes_read, count)
    );
    let _ = writeln!(
        out,
        "{}",
        total_line("disk write bytes", &totals.disk_bytes_write, count)
    );
    let _ = writeln!(
        out,
        "{}",
        total_line("disk read ops", &totals.disk_ops_read, count)
    );
    let _ = writeln!(
        out,
        "{}",
        total_line("disk write ops", &totals.disk_ops_write, count)
    );
    let _ = writeln!(out, "{}", total_line("udp sent bytes", &totals.udp_sent, count));
    let _ = writeln!(
        out,
        "{}",
        total_line("udp received bytes", &totals.udp_recv, count)
    );
    let _ = writeln!(out, "{}", total_line("tcp sent bytes", &totals.tcp_sent, count));
    let _ = writeln!(
        out,
        "{}",
        total_line("tcp received bytes", &totals.tcp_recv, count)
    );

    for (endpoint, conn) in &totals.connections {
        let _ = writeln!(out, "  connection {} (host {})", endpoint, conn.host);
        let _ = writeln!(out, "  {}", direction_line("sent", &conn.sent));
        let _ = writeln!(out, "  {}", direction_line("received", &conn.received));
    }

    out
}

fn gauge_line(name: &str, acc: &MetricAccumulator, count: u64) -> String {
    format!(
        "  {:<20} avg {:.2}  max {:.2}  min {:.2}",
        name,
        acc.average(count),
        acc.max(),
        acc.min()
    )
}

fn total_line(name: &str, acc: &MetricAccumulator, count: u64) -> String {
    format!(
        "  {:<20} total {:.0}  avg {:.2}  max {:.0}  min {:.0}",
        name,
        acc.sum(),
        acc.average(count),
        acc.max(),
        acc.min()
    )
}

fn direction_line(direction: &str, acc: &MetricAccumulator) -> String {
    format!(
        "  {:<10} total {:.0}  avg {:.2}  max {:.0}  min {:.0}",
        direction,
        acc.sum(),
        acc.mean(),
        acc.max(),
        acc.min()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn point(cpu: f64, priv_bytes: f64) -> DataPoint {
        DataPoint {
            cpu_val: Some(cpu),
            priv_bytes_val: Some(priv_bytes),
            working_bytes_val: None,
            disk_bytes_read_val: None,
            disk_bytes_write_val: None,
            disk_ops_read_val: None,
            disk_ops_write_val: None,
            udp_sent: None,
            udp_recv: None,
            tcp_sent: None,
            tcp_recv: None,
            connections_sent: Default::default(),
            connections_received: Default::default(),
            log_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn write_window(dir: &Path, name: &str, points: &[DataPoint]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string(points).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_accumulator_average_and_bounds() {
        let mut acc = MetricAccumulator::default();
        for v in [10.0, 20.0, 30.0] {
            acc.record(v);
        }
        assert_eq!(acc.sum(), 60.0);
        assert_eq!(acc.average(3), 20.0);
        assert_eq!(acc.min(), 10.0);
        assert_eq!(acc.max(), 30.0);
        assert!(acc.min() <= acc.average(3) && acc.average(3) <= acc.max());
    }

    #[test]
    fn test_accumulator_empty_does_not_divide_by_zero() {
        let acc = MetricAccumulator::default();
        assert_eq!(acc.average(0), 0.0);
        assert_eq!(acc.min(), 0.0);
        assert_eq!(acc.max(), 0.0);
    }

    #[test]
    fn test_single_window_statistics() {
        // Window with cpu {10, 20, 30}, private bytes {100, 200, 300}
        let dir = tempdir().unwrap();
        let file = write_window(
            dir.path(),
            "w.json",
            &[point(10.0, 100.0), point(20.0, 200.0), point(30.0, 300.0)],
        );

        let sink = MemorySink::new();
        let archive = dir.path().join("logged");
        let identity = ProcessIdentity::new(412, "chrome");
        let summary = run_pass(&[file], &identity, &archive, &sink).unwrap();

        assert_eq!(summary.samples, 3);
        assert_eq!(summary.archived, 1);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        let (severity, event_id, report) = &entries[0];
        assert_eq!(*severity, Severity::Info);
        assert_eq!(*event_id, REPORT_EVENT_ID);
        assert!(report.contains("3 samples"));
        assert!(report.contains("avg 20.00  max 30.00  min 10.00"));
        assert!(report.contains("avg 200.00  max 300.00  min 100.00"));
    }

    #[test]
    fn test_archive_failure_skips_file_but_pass_completes() {
        let dir = tempdir().unwrap();
        let blocked = write_window(dir.path(), "one.json", &[point(10.0, 100.0)]);
        let movable = write_window(dir.path(), "two.json", &[point(20.0, 200.0)]);

        // A directory squatting on the destination name makes the rename for
        // that one file fail; the other file still archives.
        let archive = dir.path().join("logged");
        fs::create_dir_all(archive.join("one.json")).unwrap();

        let sink = MemorySink::new();
        let identity = ProcessIdentity::new(412, "chrome");
        let summary = run_pass(
            &[blocked.clone(), movable.clone()],
            &identity,
            &archive,
            &sink,
        )
        .unwrap();

        assert_eq!(summary.samples, 2);
        assert_eq!(summary.archived, 1);
        // The report went out despite the archive failure
        assert_eq!(sink.entries().len(), 1);
        assert_eq!(sink.entries()[0].1, REPORT_EVENT_ID);
        // The blocked file stays pending, the other moved
        assert!(blocked.exists());
        assert!(!movable.exists());
        assert!(archive.join("two.json").is_file());
    }

    #[test]
    fn test_connection_rollups_per_endpoint() {
        // Endpoint A sent {50, 150}, endpoint B sent {100}
        let mut first = point(1.0, 1.0);
        first.connections_sent.insert("a:1".into(), 50);
        first.connections_sent.insert("b:2".into(), 100);
        let mut second = point(1.0, 1.0);
        second.connections_sent.insert("a:1".into(), 150);

        let mut totals = UsageTotals::default();
        totals.fold(&first);
        totals.fold(&second);

        let a = &totals.connections["a:1"];
        assert_eq!(a.sent.sum(), 200.0);
        assert_eq!(a.sent.mean(), 100.0);
        assert_eq!(a.sent.max(), 150.0);
        assert_eq!(a.sent.min(), 50.0);

        let b = &totals.connections["b:2"];
        assert_eq!(b.sent.sum(), 100.0);
        assert_eq!(b.sent.mean(), 100.0);
        assert_eq!(b.sent.max(), 100.0);
        assert_eq!(b.sent.min(), 100.0);
    }

    #[test]
    fn test_zero_file_pass_emits_degenerate_report() {
        let dir = tempdir().unwrap();
        let sink = MemorySink::new();
        let identity = ProcessIdentity::new(1, "idle");

        let summary = run_pass(&[], &identity, &dir.path().join("logged"), &sink).unwrap();
        assert_eq!(summary.samples, 0);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].2.contains("0 samples"));
    }

    #[test]
    fn test_parse_failure_aborts_without_archiving() {
        let dir = tempdir().unwrap();
        let good = write_window(dir.path(), "good.json", &[point(5.0, 5.0)]);
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "not json").unwrap();

        let sink = MemorySink::new();
        let archive = dir.path().join("logged");
        let identity = ProcessIdentity::new(1, "p");

        let result = run_pass(&[good.clone(), bad.clone()], &identity, &archive, &sink);
        assert!(matches!(result, Err(AggregateError::Parse { .. })));

        // No report, no archiving, both files stay in place
        assert!(sink.entries().is_empty());
        assert!(good.exists());
        assert!(bad.exists());
        assert!(!archive.exists());
    }

    #[test]
    fn test_archiving_moves_processed_files() {
        let dir = tempdir().unwrap();
        let file = write_window(dir.path(), "w.json", &[point(1.0, 1.0)]);
        let archive = dir.path().join("logged");
        let sink = MemorySink::new();
        let identity = ProcessIdentity::new(1, "p");

        run_pass(&[file.clone()], &identity, &archive, &sink).unwrap();

        assert!(!file.exists());
        assert!(archive.join("w.json").exists());
    }

    #[test]
    fn test_files_already_in_archive_are_left_alone() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("logged");
        fs::create_dir_all(&archive).unwrap();
        let file = write_window(&archive, "w.json", &[point(1.0, 1.0)]);

        let sink = MemorySink::new();
        let identity = ProcessIdentity::new(1, "p");
        let summary = run_pass(&[file.clone()], &identity, &archive, &sink).unwrap();

        assert_eq!(summary.archived, 1);
        assert!(file.exists());
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("93.184.216.34:443"), "93.184.216.34");
        assert_eq!(host_label("[::1]:8080"), "::1");
        assert_eq!(host_label("plain"), "plain");
    }

    #[test]
    fn test_report_lists_endpoints_in_order() {
        let mut p = point(1.0, 1.0);
        p.connections_sent.insert("b.example:1".into(), 10);
        p.connections_sent.insert("a.example:1".into(), 20);

        let mut totals = UsageTotals::default();
        totals.fold(&p);

        let report = format_report(&ProcessIdentity::new(1, "p"), &totals, 1);
        let a_pos = report.find("a.example").unwrap();
        let b_pos = report.find("b.example").unwrap();
        assert!(a_pos < b_pos);
    }
}
