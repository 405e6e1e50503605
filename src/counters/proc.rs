//! Linux /proc implementations of the counter source and process directory.
//!
//! CPU readings come from `/proc/<pid>/stat` utime+stime deltas, memory from
//! `/proc/<pid>/smaps_rollup` (falling back to the full `smaps`), disk
//! counters from `/proc/<pid>/io`, and network counters from the per-process
//! socket tables under `/proc/<pid>/net/`. Per-endpoint byte counts are the
//! socket send/receive queue depths observed at snapshot time.

use std::fs;
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::debug;

use super::{CounterError, CounterHandle, CounterSource, ExitEvent, HandleSet, ProcessDirectory};
use crate::sample::IoSnapshot;

/// Get system clock ticks per second (usually 100, but can vary).
fn get_clk_tck() -> f64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is safe to call with _SC_CLK_TCK
        // Returns -1 on error, 0 if undefined - both are handled by the > 0 check
        unsafe {
            let tck = libc::sysconf(libc::_SC_CLK_TCK);
            if tck > 0 {
                return tck as f64;
            }
        }
    }
    // Fallback to common default for error cases or non-Unix platforms
    100.0
}

/// System clock ticks per second (for CPU time calculation).
pub static CLK_TCK: Lazy<f64> = Lazy::new(get_clk_tck);

/// How often exit-watcher threads re-check that their process is alive.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Parse total CPU time (user+system) in seconds from /proc/<pid>/stat.
pub fn parse_cpu_time_seconds(proc_path: &Path) -> Result<f64, std::io::Error> {
    let stat_path = proc_path.join("stat");
    let content = fs::read_to_string(stat_path)?;

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() <= 14 {
        return Err(std::io::Error::other("Invalid stat format"));
    }

    let utime: f64 = parts[13].parse().unwrap_or(0.0);
    let stime: f64 = parts[14].parse().unwrap_or(0.0);

    Ok((utime + stime) / *CLK_TCK)
}

/// Parses kilobyte values from smaps-style lines.
fn parse_kb_value(v: &str) -> Option<u64> {
    v.split_whitespace().next()?.parse().ok()
}

/// Parses (working set, private bytes) from an smaps or smaps_rollup file.
fn parse_smaps_file(path: &Path) -> Result<(u64, u64), std::io::Error> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut rss_kb = 0;
    let mut private_clean_kb = 0;
    let mut private_dirty_kb = 0;

    for line in reader.lines() {
        let l = line?;
        if let Some(v) = l.strip_prefix("Rss:") {
            rss_kb += parse_kb_value(v).unwrap_or(0);
        } else if let Some(v) = l.strip_prefix("Private_Clean:") {
            private_clean_kb += parse_kb_value(v).unwrap_or(0);
        } else if let Some(v) = l.strip_prefix("Private_Dirty:") {
            private_dirty_kb += parse_kb_value(v).unwrap_or(0);
        }
    }

    Ok((rss_kb * 1024, (private_clean_kb + private_dirty_kb) * 1024))
}

/// Reads (working set, private bytes) using the fastest available parser.
/// Uses smaps_rollup when available (Linux >= 4.14), otherwise full smaps.
pub fn parse_memory(proc_path: &Path) -> Result<(u64, u64), std::io::Error> {
    let rollup = proc_path.join("smaps_rollup");
    if rollup.exists() {
        return parse_smaps_file(&rollup);
    }
    parse_smaps_file(&proc_path.join("smaps"))
}

/// Reads disk counters from /proc/<pid>/io.
/// Returns (read_bytes, write_bytes, read_ops, write_ops).
/// Note: requires appropriate permissions (usually root or CAP_SYS_PTRACE).
pub fn read_disk_io(proc_path: &Path) -> Result<(u64, u64, u64, u64), std::io::Error> {
    let content = fs::read_to_string(proc_path.join("io"))?;

    let mut read_bytes = 0u64;
    let mut write_bytes = 0u64;
    let mut read_ops = 0u64;
    let mut write_ops = 0u64;

    for line in content.lines() {
        if let Some(v) = line.strip_prefix("read_bytes:") {
            read_bytes = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("write_bytes:") {
            write_bytes = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("syscr:") {
            read_ops = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("syscw:") {
            write_ops = v.trim().parse().unwrap_or(0);
        }
    }

    Ok((read_bytes, write_bytes, read_ops, write_ops))
}

/// Decodes a kernel hex socket address ("0100007F:0050" or the IPv6
/// equivalent) into an "ip:port" endpoint key.
pub fn decode_socket_addr(hex: &str) -> Option<String> {
    let (addr_hex, port_hex) = hex.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    match addr_hex.len() {
        8 => {
            // One 32-bit word printed in host byte order
            let raw = u32::from_str_radix(addr_hex, 16).ok()?;
            let ip = Ipv4Addr::from(raw.to_le_bytes());
            Some(format!("{}:{}", ip, port))
        }
        32 => {
            // Four 32-bit words, each printed in host byte order
            let mut bytes = [0u8; 16];
            for (i, chunk) in addr_hex.as_bytes().chunks(8).enumerate() {
                let chunk = std::str::from_utf8(chunk).ok()?;
                let raw = u32::from_str_radix(chunk, 16).ok()?;
                bytes[i * 4..i * 4 + 4].copy_from_slice(&raw.to_le_bytes());
            }
            let ip = Ipv6Addr::from(bytes);
            Some(format!("[{}]:{}", ip, port))
        }
        _ => None,
    }
}

/// One row of a /proc/<pid>/net socket table that carries a remote peer.
struct SocketRow {
    endpoint: String,
    tx_queue: u64,
    rx_queue: u64,
}

/// Parses a socket table (tcp/tcp6/udp/udp6 format), keeping rows with a
/// non-zero remote address. Listening TCP sockets (state 0A) are skipped.
fn parse_socket_table(content: &str) -> Vec<SocketRow> {
    let mut rows = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue; // Skip malformed lines
        }

        let remote = parts[2];
        let state = parts[3];
        if state == "0A" {
            continue;
        }
        let Some((addr_hex, _)) = remote.split_once(':') else {
            continue;
        };
        if addr_hex.bytes().all(|b| b == b'0') {
            continue;
        }

        let endpoint = match decode_socket_addr(remote) {
            Some(e) => e,
            None => continue,
        };

        let Some((tx_hex, rx_hex)) = parts[4].split_once(':') else {
            continue;
        };
        rows.push(SocketRow {
            endpoint,
            tx_queue: u64::from_str_radix(tx_hex, 16).unwrap_or(0),
            rx_queue: u64::from_str_radix(rx_hex, 16).unwrap_or(0),
        });
    }

    rows
}

/// CPU handle: percent of one core from stat utime+stime deltas.
struct CpuCounter {
    proc_path: PathBuf,
    last_cpu_seconds: f64,
    last_read: Instant,
}

impl CounterHandle for CpuCounter {
    fn next_value(&mut self) -> Result<f64, CounterError> {
        let total = parse_cpu_time_seconds(&self.proc_path)?;
        let now = Instant::now();
        let dt = now.duration_since(self.last_read).as_secs_f64();

        let mut percent = 0.0;
        if dt > 0.0 {
            let delta = total - self.last_cpu_seconds;
            if delta > 0.0 {
                percent = (delta / dt) * 100.0;
            }
        }

        self.last_cpu_seconds = total;
        self.last_read = now;
        Ok(percent)
    }
}

/// Private-memory handle: Private_Clean + Private_Dirty in bytes.
struct PrivateBytesCounter {
    proc_path: PathBuf,
}

impl CounterHandle for PrivateBytesCounter {
    fn next_value(&mut self) -> Result<f64, CounterError> {
        let (_, private) = parse_memory(&self.proc_path)?;
        Ok(private as f64)
    }
}

/// Working-set handle: resident set size in bytes.
struct WorkingSetCounter {
    proc_path: PathBuf,
}

impl CounterHandle for WorkingSetCounter {
    fn next_value(&mut self) -> Result<f64, CounterError> {
        let (rss, _) = parse_memory(&self.proc_path)?;
        Ok(rss as f64)
    }
}

/// Counter source backed by the /proc filesystem.
pub struct ProcCounterSource {
    proc_root: PathBuf,
}

impl ProcCounterSource {
    pub fn new() -> Self {
        Self::for_root("/proc")
    }

    /// Uses an alternate filesystem root, for tests.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn proc_path(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }
}

impl Default for ProcCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for ProcCounterSource {
    fn acquire(&self, slot: &str, pid: u32) -> Result<HandleSet, CounterError> {
        let proc_path = self.proc_path(pid);
        if !proc_path.join("stat").exists() {
            return Err(CounterError::SlotUnavailable(pid));
        }
        debug!("acquiring /proc counters for pid {} (slot {})", pid, slot);

        Ok(HandleSet {
            cpu: Box::new(CpuCounter {
                proc_path: proc_path.clone(),
                last_cpu_seconds: 0.0,
                last_read: Instant::now(),
            }),
            private_bytes: Box::new(PrivateBytesCounter {
                proc_path: proc_path.clone(),
            }),
            working_set: Box::new(WorkingSetCounter { proc_path }),
        })
    }

    fn io_snapshot(&self, pid: u32) -> Option<IoSnapshot> {
        let proc_path = self.proc_path(pid);
        if !proc_path.exists() {
            return None;
        }

        let mut snapshot = IoSnapshot::default();

        match read_disk_io(&proc_path) {
            Ok((rb, wb, ro, wo)) => {
                snapshot.disk_bytes_read = rb;
                snapshot.disk_bytes_written = wb;
                snapshot.disk_ops_read = ro;
                snapshot.disk_ops_written = wo;
            }
            Err(e) => debug!("disk counters unavailable for pid {}: {}", pid, e),
        }

        for table in ["net/tcp", "net/tcp6"] {
            if let Ok(content) = fs::read_to_string(proc_path.join(table)) {
                for row in parse_socket_table(&content) {
                    snapshot.tcp_sent += row.tx_queue;
                    snapshot.tcp_received += row.rx_queue;
                    *snapshot
                        .connections_sent
                        .entry(row.endpoint.clone())
                        .or_insert(0) += row.tx_queue;
                    *snapshot.connections_received.entry(row.endpoint).or_insert(0) +=
                        row.rx_queue;
                }
            }
        }

        for table in ["net/udp", "net/udp6"] {
            if let Ok(content) = fs::read_to_string(proc_path.join(table)) {
                for row in parse_socket_table(&content) {
                    snapshot.udp_sent += row.tx_queue;
                    snapshot.udp_received += row.rx_queue;
                }
            }
        }

        Some(snapshot)
    }
}

/// Process directory backed by the /proc filesystem.
pub struct ProcDirectory {
    proc_root: PathBuf,
}

impl ProcDirectory {
    pub fn new() -> Self {
        Self::for_root("/proc")
    }

    /// Uses an alternate filesystem root, for tests.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }
}

impl Default for ProcDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a process name from comm, falling back to the cmdline basename.
pub fn read_process_name(proc_path: &Path) -> Option<String> {
    let comm = proc_path.join("comm");
    if let Ok(s) = fs::read_to_string(&comm) {
        let t = s.trim();
        if !t.is_empty() {
            return Some(t.into());
        }
    }

    let cmd = proc_path.join("cmdline");
    if let Ok(content) = fs::read(&cmd) {
        if !content.is_empty() {
            let parts: Vec<&str> = content
                .split(|&b| b == 0u8)
                .filter_map(|s| std::str::from_utf8(s).ok())
                .collect();
            if !parts.is_empty() {
                if let Some(name) = Path::new(parts[0]).file_name() {
                    return name.to_str().map(|s| s.to_string());
                }
            }
        }
    }
    None
}

impl ProcessDirectory for ProcDirectory {
    fn image_name(&self, pid: u32) -> Option<String> {
        read_process_name(&self.proc_root.join(pid.to_string()))
    }

    fn siblings(&self, image_name: &str) -> Vec<u32> {
        let mut out = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.proc_root) {
            for entry in entries.flatten() {
                let p = entry.path();
                let name = match p.file_name().and_then(|s| s.to_str()) {
                    Some(v) => v,
                    None => continue,
                };
                if !name.chars().all(|c| c.is_ascii_digit()) {
                    continue;
                }
                let pid: u32 = match name.parse() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if read_process_name(&p).as_deref() == Some(image_name) {
                    out.push(pid);
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn watch_exit(&self, pid: u32, notify: Sender<ExitEvent>) -> Result<(), CounterError> {
        let proc_path = self.proc_root.join(pid.to_string());
        if !proc_path.exists() {
            return Err(CounterError::Watch {
                pid,
                reason: "process not found".into(),
            });
        }

        // Poll-based watcher: /proc has no exit notification for arbitrary
        // pids without ptrace. The thread ends when the process disappears
        // or the receiving side goes away.
        thread::Builder::new()
            .name(format!("exit-watch-{}", pid))
            .spawn(move || {
                while proc_path.exists() {
                    thread::sleep(EXIT_POLL_INTERVAL);
                }
                // Receiver may already be gone at shutdown
                let _ = notify.send(ExitEvent { pid });
            })
            .map_err(|e| CounterError::Watch {
                pid,
                reason: e.to_string(),
            })?;

        Ok(())
    }
}
