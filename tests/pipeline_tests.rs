//! End-to-end tests for the flush and aggregation pipeline.
//!
//! These tests drive the storage layer through its public API: samples are
//! flushed into window files, picked up by an aggregation pass, reported,
//! and archived. No live process is involved.

use std::fs;

use chrono::{Duration, TimeZone, Utc};
use tempfile::tempdir;

use procpulse::aggregate::{run_pass, MemorySink, Severity, REPORT_EVENT_ID};
use procpulse::counters::ProcessIdentity;
use procpulse::sample::{DataPoint, EndpointMap, IoSnapshot};
use procpulse::window::{flush_window, scan_pending, CacheWindow, UnloggedFiles, ARCHIVE_DIR_NAME};

fn point_with_memory(priv_bytes: f64, offset_secs: i64) -> DataPoint {
    let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap() + Duration::seconds(offset_secs);
    DataPoint {
        priv_bytes_val: Some(priv_bytes),
        log_time: ts,
        ..empty_point(offset_secs)
    }
}

fn empty_point(offset_secs: i64) -> DataPoint {
    let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap() + Duration::seconds(offset_secs);
    DataPoint::from_readings(0.0, 0.0, 0.0, IoSnapshot::default(), ts)
}

#[test]
fn test_flushed_windows_flow_through_aggregation() {
    let dir = tempdir().unwrap();
    let pending = dir.path().join("app");
    let archive = pending.join(ARCHIVE_DIR_NAME);
    let identity = ProcessIdentity::new(42, "app");
    let unlogged = UnloggedFiles::new();

    let start = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();

    // Two windows of samples with distinct private-memory readings
    let mut cache = CacheWindow::new();
    cache.push(point_with_memory(100.0, 0));
    cache.push(point_with_memory(200.0, 30));
    flush_window(
        &mut cache,
        &pending,
        &identity,
        start,
        start + Duration::seconds(60),
        &unlogged,
    )
    .unwrap();

    cache.push(point_with_memory(300.0, 60));
    flush_window(
        &mut cache,
        &pending,
        &identity,
        start + Duration::seconds(60),
        start + Duration::seconds(120),
        &unlogged,
    )
    .unwrap();

    let files = unlogged.drain();
    assert_eq!(files.len(), 2);

    let sink = MemorySink::new();
    let summary = run_pass(&files, &identity, &archive, &sink).unwrap();
    assert_eq!(summary.samples, 3);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.archived, 2);

    let entries = sink.entries();
    let (severity, event_id, report) = &entries[0];
    assert_eq!(*severity, Severity::Info);
    assert_eq!(*event_id, REPORT_EVENT_ID);
    assert!(report.contains("avg 200.00"), "{report}");
    assert!(report.contains("max 300.00"), "{report}");
    assert!(report.contains("min 100.00"), "{report}");

    // Both files moved out of the pending directory
    let remaining: Vec<_> = fs::read_dir(&pending)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert!(remaining.is_empty());
    assert_eq!(fs::read_dir(&archive).unwrap().count(), 2);
}

#[test]
fn test_per_endpoint_traffic_averaged_by_endpoint_occurrences() {
    let dir = tempdir().unwrap();
    let pending = dir.path().join("svc");
    let archive = pending.join(ARCHIVE_DIR_NAME);
    let identity = ProcessIdentity::new(7, "svc");
    let unlogged = UnloggedFiles::new();
    let start = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();

    // Endpoint A appears in two samples, endpoint B in one
    let endpoint_a = "10.0.0.5:443";
    let endpoint_b = "10.0.0.9:80";

    let mut cache = CacheWindow::new();
    for (offset, entries) in [
        (0, vec![(endpoint_a, 50u64)]),
        (30, vec![(endpoint_a, 150), (endpoint_b, 100)]),
    ] {
        let mut sent = EndpointMap::default();
        for (key, bytes) in entries {
            sent.insert(key.to_string(), bytes);
        }
        let mut point = empty_point(offset);
        point.connections_sent = sent;
        cache.push(point);
    }
    flush_window(
        &mut cache,
        &pending,
        &identity,
        start,
        start + Duration::seconds(60),
        &unlogged,
    )
    .unwrap();

    let sink = MemorySink::new();
    run_pass(&unlogged.drain(), &identity, &archive, &sink).unwrap();

    let report = sink.entries()[0].2.clone();
    // A: (50 + 150) / 2 observations; B: 100 / 1 observation
    assert!(report.contains("10.0.0.5"), "{report}");
    assert!(report.contains("avg 100.00"), "{report}");
    assert!(report.contains("10.0.0.9"), "{report}");
}

#[test]
fn test_recovery_scan_ignores_archive_and_foreign_files() {
    let dir = tempdir().unwrap();
    let pending = dir.path().join("app");
    let archive = pending.join(ARCHIVE_DIR_NAME);
    fs::create_dir_all(&archive).unwrap();

    fs::write(pending.join("app_42-b.json"), "[]").unwrap();
    fs::write(pending.join("app_42-a.json"), "[]").unwrap();
    fs::write(pending.join("notes.txt"), "scratch").unwrap();
    fs::write(archive.join("app_42-old.json"), "[]").unwrap();

    let found = scan_pending(&pending);
    let names: Vec<_> = found
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["app_42-a.json", "app_42-b.json"]);
}

#[test]
fn test_window_files_from_other_writers_parse() {
    // A file with unknown ordering and missing optional fields still parses
    let dir = tempdir().unwrap();
    let pending = dir.path().join("app");
    let archive = pending.join(ARCHIVE_DIR_NAME);
    fs::create_dir_all(&pending).unwrap();

    let body = r#"[
        {"LogTime": "2024-03-05T12:00:00Z", "CpuVal": 12.5},
        {"PrivBytesVal": 2048.0, "LogTime": "2024-03-05T12:00:30Z"}
    ]"#;
    let file = pending.join("app_42-20240305120000-20240305120100.json");
    fs::write(&file, body).unwrap();

    let identity = ProcessIdentity::new(42, "app");
    let sink = MemorySink::new();
    let summary = run_pass(&[file], &identity, &archive, &sink).unwrap();
    assert_eq!(summary.samples, 2);
}
