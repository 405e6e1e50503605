//! Cache window buffering and the durable flush protocol.
//!
//! Samples accumulate in an in-memory window bounded by the cache-write
//! interval. When a tick crosses the boundary the window is serialized as one
//! JSON array into a uniquely named file, the path is recorded on the
//! unlogged-file queue for the aggregator, and the window is cleared. An
//! empty window is never flushed, and a failed flush leaves the window
//! intact for retry at the next boundary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::counters::ProcessIdentity;
use crate::sample::DataPoint;

/// Window stamp format, second precision. Collision-free per instance
/// because windows never overlap.
pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Name of the archive subdirectory for aggregated window files.
pub const ARCHIVE_DIR_NAME: &str = "logged";

/// The in-memory, time-bounded buffer of samples between two flush points.
#[derive(Default)]
pub struct CacheWindow {
    points: Vec<DataPoint>,
}

impl CacheWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: DataPoint) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn clear(&mut self) {
        self.points.clear();
    }
}

/// File name for a flushed window: `<owner>_<pid>-<start>-<end>.json`.
pub fn window_file_name(
    identity: &ProcessIdentity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    format!(
        "{}-{}-{}.json",
        identity.file_prefix(),
        start.format(STAMP_FORMAT),
        end.format(STAMP_FORMAT),
    )
}

/// Serializes the window to its file and records it as unlogged.
///
/// Returns the written path, or `None` for an empty window (no file is
/// produced and the queue is untouched). On error the window is *not*
/// cleared, so the data is retried at the next flush trigger.
pub fn flush_window(
    cache: &mut CacheWindow,
    dir: &Path,
    identity: &ProcessIdentity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    unlogged: &UnloggedFiles,
) -> Result<Option<PathBuf>, std::io::Error> {
    if cache.is_empty() {
        debug!("cache window [{} .. {}) empty, nothing to flush", start, end);
        return Ok(None);
    }

    fs::create_dir_all(dir)?;
    let path = dir.join(window_file_name(identity, start, end));
    let body = serde_json::to_vec(&cache.points)?;
    fs::write(&path, body)?;

    debug!(
        "flushed {} samples to {}",
        cache.len(),
        path.display()
    );
    unlogged.push(path.clone());
    cache.clear();
    Ok(Some(path))
}

/// Lists leftover pending window files from a prior run, oldest first.
/// Archived files under the `logged/` subdirectory are not included.
pub fn scan_pending(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// The set of flushed window files not yet aggregated.
///
/// Shared between the flush path (producer) and the aggregation pass
/// (consumer on its own thread). Appends and the drain are serialized by one
/// mutex; the drain swaps the whole list out, so files flushed during an
/// aggregation pass queue for the next pass instead of being lost or
/// double-processed.
#[derive(Clone, Default)]
pub struct UnloggedFiles {
    inner: Arc<Mutex<Vec<PathBuf>>>,
}

impl UnloggedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, path: PathBuf) {
        self.inner
            .lock()
            .expect("unlogged list lock poisoned")
            .push(path);
    }

    /// Queues recovered files from a prior run.
    pub fn extend(&self, paths: impl IntoIterator<Item = PathBuf>) {
        self.inner
            .lock()
            .expect("unlogged list lock poisoned")
            .extend(paths);
    }

    /// Atomically takes the whole list, leaving it empty.
    pub fn drain(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.inner.lock().expect("unlogged list lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("unlogged list lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
