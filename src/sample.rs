//! Sample data model for the telemetry collector.
//!
//! This module defines the `DataPoint` record that is buffered in the cache
//! window and serialized into flushed window files, plus the CPU
//! normalization helpers used when a sample is taken.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Map from remote-endpoint key to a byte count, hashed with ahash.
pub type EndpointMap = HashMap<String, u64, ahash::RandomState>;

/// Get the number of online CPU cores.
fn get_num_cores() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is safe to call with _SC_NPROCESSORS_ONLN
        // Returns -1 on error - handled by the > 0 check
        unsafe {
            let n = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
            if n > 0 {
                return n as u32;
            }
        }
    }
    // Fallback for error cases or non-Unix platforms
    1
}

/// Number of online CPU cores (for CPU percent normalization).
pub static NUM_CORES: Lazy<u32> = Lazy::new(get_num_cores);

/// Normalize a percent-of-one-core CPU reading to a 0-100 percent-of-all-cores
/// scale: divide by (core count * 100), then scale back to percent.
pub fn normalize_cpu_percent(raw_percent: f64, cores: u32) -> f64 {
    if cores == 0 {
        return 0.0;
    }
    raw_percent / (cores as f64 * 100.0) * 100.0
}

/// Best-effort snapshot of disk and network counters for one process.
///
/// A zeroed snapshot stands in when the counter source reports the data as
/// unavailable; sampling continues either way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoSnapshot {
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
    pub disk_ops_read: u64,
    pub disk_ops_written: u64,
    pub udp_sent: u64,
    pub udp_received: u64,
    pub tcp_sent: u64,
    pub tcp_received: u64,
    /// Bytes observed as sent to each remote endpoint at snapshot time.
    pub connections_sent: EndpointMap,
    /// Bytes observed as received from each remote endpoint at snapshot time.
    pub connections_received: EndpointMap,
}

/// One sample of the monitored process, immutable once created.
///
/// The serialized field names are the on-disk window file format and must
/// round-trip exactly; null-valued fields are omitted on write and tolerated
/// as absent on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// CPU percent normalized to 0-100 across all cores.
    #[serde(rename = "CpuVal", default, skip_serializing_if = "Option::is_none")]
    pub cpu_val: Option<f64>,

    /// Private (non-shared) memory in bytes.
    #[serde(
        rename = "PrivBytesVal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub priv_bytes_val: Option<f64>,

    /// Working set (resident) memory in bytes.
    #[serde(
        rename = "WorkingBytesVal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub working_bytes_val: Option<f64>,

    #[serde(
        rename = "DiskBytesReadVal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub disk_bytes_read_val: Option<u64>,

    #[serde(
        rename = "DiskBytesWriteVal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub disk_bytes_write_val: Option<u64>,

    #[serde(
        rename = "DiskOpsReadVal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub disk_ops_read_val: Option<u64>,

    #[serde(
        rename = "DiskOpsWriteVal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub disk_ops_write_val: Option<u64>,

    #[serde(rename = "UdpSent", default, skip_serializing_if = "Option::is_none")]
    pub udp_sent: Option<u64>,

    #[serde(rename = "UdpRecv", default, skip_serializing_if = "Option::is_none")]
    pub udp_recv: Option<u64>,

    #[serde(rename = "TcpSent", default, skip_serializing_if = "Option::is_none")]
    pub tcp_sent: Option<u64>,

    #[serde(rename = "TcpRecv", default, skip_serializing_if = "Option::is_none")]
    pub tcp_recv: Option<u64>,

    /// Bytes sent per remote endpoint key at sample time.
    #[serde(
        rename = "ConnectionsSent",
        default,
        skip_serializing_if = "EndpointMap::is_empty"
    )]
    pub connections_sent: EndpointMap,

    /// Bytes received per remote endpoint key at sample time.
    #[serde(
        rename = "ConnectionsReceived",
        default,
        skip_serializing_if = "EndpointMap::is_empty"
    )]
    pub connections_received: EndpointMap,

    /// Timestamp the sample was taken.
    #[serde(rename = "LogTime")]
    pub log_time: DateTime<Utc>,
}

impl DataPoint {
    /// Builds a sample from the three counter readings plus an IO snapshot.
    ///
    /// The raw CPU value is a percent-of-one-core reading and is normalized
    /// here; the snapshot is consumed as-is.
    pub fn from_readings(
        cpu_raw_percent: f64,
        priv_bytes: f64,
        working_bytes: f64,
        io: IoSnapshot,
        log_time: DateTime<Utc>,
    ) -> Self {
        Self {
            cpu_val: Some(normalize_cpu_percent(cpu_raw_percent, *NUM_CORES)),
            priv_bytes_val: Some(priv_bytes),
            working_bytes_val: Some(working_bytes),
            disk_bytes_read_val: Some(io.disk_bytes_read),
            disk_bytes_write_val: Some(io.disk_bytes_written),
            disk_ops_read_val: Some(io.disk_ops_read),
            disk_ops_write_val: Some(io.disk_ops_written),
            udp_sent: Some(io.udp_sent),
            udp_recv: Some(io.udp_received),
            tcp_sent: Some(io.tcp_sent),
            tcp_recv: Some(io.tcp_received),
            connections_sent: io.connections_sent,
            connections_received: io.connections_received,
            log_time,
        }
    }
}
