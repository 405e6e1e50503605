//! The per-process monitoring instance.
//!
//! One `ProcessMonitor` owns the whole pipeline for one monitored process:
//! it is driven by an external ticking caller, samples the counter handles,
//! rotates and flushes cache windows, and launches aggregation passes on a
//! background worker so a slow pass never delays the sampling tick. Multiple
//! instances are fully independent and share no mutable state.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::aggregate::{
    self, ReportSink, Severity, AGGREGATION_ERROR_EVENT_ID, FINISH_EVENT_ID,
};
use crate::counters::{CounterError, CounterSource, HandleSet, ProcessIdentity};
use crate::resolver::HandleResolver;
use crate::sample::DataPoint;
use crate::window::{flush_window, CacheWindow, UnloggedFiles, ARCHIVE_DIR_NAME};

/// How the instance schedules its log interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Continuously scheduled: the log interval advances after each pass.
    Service,
    /// One-shot: the log interval end is computed once and never recomputed,
    /// and window files are written directly into the archive directory.
    Command,
}

/// Interval lengths and storage location for one monitoring instance.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub data_root: PathBuf,
    pub write_interval: Duration,
    pub log_interval: Duration,
    pub mode: RunMode,
}

/// Monitoring instance for exactly one process.
pub struct ProcessMonitor {
    identity: ProcessIdentity,
    settings: MonitorSettings,
    resolver: HandleResolver,
    source: Arc<dyn CounterSource>,
    sink: Arc<dyn ReportSink>,
    handles: Option<HandleSet>,
    /// Set when a counter read fails mid-run: the process is gone and the
    /// instance winds down. Resolution failures do not set this.
    lost: bool,
    cache: CacheWindow,
    cache_start: DateTime<Utc>,
    cache_finish: DateTime<Utc>,
    log_start: DateTime<Utc>,
    log_finish: DateTime<Utc>,
    unlogged: UnloggedFiles,
    /// At most one aggregation worker is in flight per instance.
    worker: Option<JoinHandle<()>>,
    replaying: bool,
    finished: bool,
}

impl ProcessMonitor {
    /// Creates an instance and resolves its initial counter handles.
    ///
    /// `start_time` recovers window boundaries from a prior run; `recovered`
    /// queues that run's leftover pending files, which are folded into the
    /// first aggregation pass without advancing the log interval.
    pub fn new(
        identity: ProcessIdentity,
        settings: MonitorSettings,
        mut resolver: HandleResolver,
        source: Arc<dyn CounterSource>,
        sink: Arc<dyn ReportSink>,
        start_time: Option<DateTime<Utc>>,
        recovered: Vec<PathBuf>,
    ) -> Self {
        let start = start_time.unwrap_or_else(Utc::now);
        let replaying = !recovered.is_empty();
        let unlogged = UnloggedFiles::new();
        if replaying {
            info!(
                "recovered {} pending window files for {}",
                recovered.len(),
                identity
            );
            unlogged.extend(recovered);
        }

        let handles = resolver.resolve();
        if handles.is_none() {
            debug!("initial handle resolution failed for {}", identity);
        }

        Self {
            cache_start: start,
            cache_finish: start + settings.write_interval,
            log_start: start,
            log_finish: start + settings.log_interval,
            identity,
            settings,
            resolver,
            source,
            sink,
            handles,
            lost: false,
            cache: CacheWindow::new(),
            unlogged,
            worker: None,
            replaying,
            finished: false,
        }
    }

    /// Directory that receives freshly flushed window files.
    pub fn pending_dir(&self) -> PathBuf {
        let dir = self.settings.data_root.join(&self.identity.owner);
        match self.settings.mode {
            RunMode::Service => dir,
            RunMode::Command => dir.join(ARCHIVE_DIR_NAME),
        }
    }

    /// Directory that receives aggregated window files.
    pub fn archive_dir(&self) -> PathBuf {
        self.settings
            .data_root
            .join(&self.identity.owner)
            .join(ARCHIVE_DIR_NAME)
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Current cache window size, mostly useful to tests and health checks.
    pub fn cached_samples(&self) -> usize {
        self.cache.len()
    }

    pub fn pending_files(&self) -> usize {
        self.unlogged.len()
    }

    pub fn log_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.log_start, self.log_finish)
    }

    pub fn cache_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.cache_start, self.cache_finish)
    }

    /// One cooperative tick: process queued re-resolutions, rotate and flush
    /// the cache window if its boundary passed, take a sample, and launch an
    /// aggregation pass if the log boundary passed.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if self.finished {
            return;
        }

        self.reap_worker();

        // A sibling exit shifts slot indices; handles must be rebuilt
        if !self.lost && self.resolver.take_exit_events() {
            debug!("re-resolving counter handles for {}", self.identity);
            self.handles = self.resolver.resolve();
        }

        if now >= self.cache_finish {
            self.rotate_window();
        }

        self.sample(now);

        if now >= self.log_finish && !self.unlogged.is_empty() {
            self.launch_aggregation();
        }

        // Permanent instrumentation loss winds the instance down
        if self.lost {
            self.finish_monitoring(now);
        }
    }

    /// Forces the shutdown sequence: null the handles, dump the current
    /// cache even mid-window, join any in-flight pass, then run one final
    /// aggregation pass synchronously (possibly over zero files).
    pub fn finish_monitoring(&mut self, now: DateTime<Utc>) {
        if self.finished {
            return;
        }
        info!("finishing monitoring for {}", self.identity);

        self.handles = None;
        self.lost = true;

        let pending = self.pending_dir();
        if let Err(e) = flush_window(
            &mut self.cache,
            &pending,
            &self.identity,
            self.cache_start,
            now,
            &self.unlogged,
        ) {
            error!("final cache dump failed for {}: {}", self.identity, e);
        }

        self.join_aggregation();
        run_pass_logged(
            &self.unlogged,
            &self.identity,
            &self.archive_dir(),
            self.sink.as_ref(),
        );

        self.sink.emit(
            Severity::Info,
            FINISH_EVENT_ID,
            &format!("monitoring finished for {}", self.identity),
        );
        self.finished = true;
    }

    /// Blocks until the in-flight aggregation pass, if any, completes.
    pub fn join_aggregation(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("aggregation worker panicked for {}", self.identity);
            }
        }
    }

    fn reap_worker(&mut self) {
        if self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            self.join_aggregation();
        }
    }

    /// Advances the cache interval and flushes the completed window before
    /// any sample is appended for the new one.
    fn rotate_window(&mut self) {
        let (start, end) = (self.cache_start, self.cache_finish);
        self.cache_start = self.cache_finish;
        self.cache_finish = self.cache_start + self.settings.write_interval;

        let pending = self.pending_dir();
        if let Err(e) = flush_window(
            &mut self.cache,
            &pending,
            &self.identity,
            start,
            end,
            &self.unlogged,
        ) {
            // Cache is retained by flush_window, retried at the next boundary
            error!(
                "flush failed for window [{} .. {}) of {}: {}",
                start, end, self.identity, e
            );
        }
    }

    fn sample(&mut self, now: DateTime<Utc>) {
        let Some(handles) = self.handles.as_mut() else {
            return;
        };

        match read_sample(handles, self.source.as_ref(), self.identity.pid, now) {
            Ok(point) => self.cache.push(point),
            Err(e) => {
                info!(
                    "counter read failed for {}, process has likely exited: {}",
                    self.identity, e
                );
                self.handles = None;
                self.lost = true;
            }
        }
    }

    fn launch_aggregation(&mut self) {
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                debug!("aggregation already in flight for {}, deferring", self.identity);
                return;
            }
        }
        self.reap_worker();

        let replayed = self.replaying;
        if self.replaying {
            // Replayed leftovers from a prior run do not advance the interval
            self.replaying = false;
        }

        let unlogged = self.unlogged.clone();
        let identity = self.identity.clone();
        let archive_dir = self.archive_dir();
        let sink = Arc::clone(&self.sink);

        // The pass drains the list itself; flushes that land while it runs
        // queue for the next pass.
        let spawned = std::thread::Builder::new()
            .name(format!("aggregate-{}", identity.pid))
            .spawn(move || {
                run_pass_logged(&unlogged, &identity, &archive_dir, sink.as_ref());
            });

        match spawned {
            Ok(handle) => {
                // The slot is consumed only once a pass is actually running;
                // a spawn failure leaves the schedule in place for the next tick.
                if !replayed && self.settings.mode == RunMode::Service {
                    self.log_start = self.log_finish;
                    self.log_finish = self.log_start + self.settings.log_interval;
                }
                self.worker = Some(handle);
            }
            Err(e) => error!(
                "could not start aggregation worker for {}: {}",
                self.identity, e
            ),
        }
    }
}

/// Reads one sample from the three handles plus an IO snapshot.
fn read_sample(
    handles: &mut HandleSet,
    source: &dyn CounterSource,
    pid: u32,
    now: DateTime<Utc>,
) -> Result<DataPoint, CounterError> {
    let cpu = handles.cpu.next_value()?;
    let priv_bytes = handles.private_bytes.next_value()?;
    let working = handles.working_set.next_value()?;
    let io = source.io_snapshot(pid).unwrap_or_default();
    Ok(DataPoint::from_readings(cpu, priv_bytes, working, io, now))
}

/// Drains the unlogged list and runs one pass, reporting failures to the
/// sink instead of propagating them.
fn run_pass_logged(
    unlogged: &UnloggedFiles,
    identity: &ProcessIdentity,
    archive_dir: &std::path::Path,
    sink: &dyn ReportSink,
) {
    let files = unlogged.drain();
    match aggregate::run_pass(&files, identity, archive_dir, sink) {
        Ok(summary) => debug!(
            "aggregation pass for {}: {} samples from {} files, {} archived",
            identity, summary.samples, summary.files, summary.archived
        ),
        Err(e) => sink.emit(
            Severity::Warning,
            AGGREGATION_ERROR_EVENT_ID,
            &format!("aggregation pass aborted for {}: {}", identity, e),
        ),
    }
}
