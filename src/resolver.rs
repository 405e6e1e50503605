//! Counter handle resolution and sibling-exit driven re-resolution.
//!
//! Instrumentation slots are not stable identifiers: when any process sharing
//! the monitored process's image name exits, slot indices shift and the three
//! counter handles must be resolved again. Exit notifications arrive on an
//! internal queue and are processed from the tick path, so re-resolution is
//! testable by injecting synthetic exit events.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashSet;
use tracing::debug;

use crate::aggregate::{ReportSink, Severity, WATCHER_WARNING_EVENT_ID};
use crate::counters::{CounterSource, ExitEvent, HandleSet, ProcessDirectory};

/// Fixed settle delay after acquiring handles, letting the underlying
/// counters begin accumulating before deltas are trusted.
pub const WARMUP_DELAY: Duration = Duration::from_millis(250);

/// Resolves the three instrumentation handles for one monitored process and
/// re-resolves when a same-image sibling exits.
pub struct HandleResolver {
    source: Arc<dyn CounterSource>,
    directory: Arc<dyn ProcessDirectory>,
    sink: Arc<dyn ReportSink>,
    pid: u32,
    warmup: Duration,
    events_tx: Sender<ExitEvent>,
    events_rx: Receiver<ExitEvent>,
    watched: AHashSet<u32>,
}

impl HandleResolver {
    pub fn new(
        source: Arc<dyn CounterSource>,
        directory: Arc<dyn ProcessDirectory>,
        sink: Arc<dyn ReportSink>,
        pid: u32,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        Self {
            source,
            directory,
            sink,
            pid,
            warmup: WARMUP_DELAY,
            events_tx,
            events_rx,
            watched: AHashSet::new(),
        }
    }

    /// Overrides the settle delay (tests pass `Duration::ZERO`).
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// A sender that feeds the re-resolution queue; tests use this to inject
    /// synthetic exit events.
    pub fn exit_sender(&self) -> Sender<ExitEvent> {
        self.events_tx.clone()
    }

    /// Drains queued exit events, returning true if any arrived. The caller
    /// re-resolves when this reports an exit.
    pub fn take_exit_events(&mut self) -> bool {
        let mut any = false;
        while let Ok(event) = self.events_rx.try_recv() {
            debug!(
                "sibling pid {} exited, instrumentation slots shifted",
                event.pid
            );
            // Its watcher has ended; a reused pid gets a fresh one
            self.watched.remove(&event.pid);
            any = true;
        }
        any
    }

    /// Resolves the instance slot for the monitored pid among its same-image
    /// siblings and acquires the three handles bound to it. Returns `None`
    /// when the slot cannot be determined; sampling then stops producing
    /// data points until a later resolution succeeds.
    pub fn resolve(&mut self) -> Option<HandleSet> {
        let image = match self.directory.image_name(self.pid) {
            Some(name) => name,
            None => {
                debug!("no image name for pid {}, handles unavailable", self.pid);
                return None;
            }
        };

        let siblings = self.directory.siblings(&image);
        let slot = match instance_slot(&image, self.pid, &siblings) {
            Some(slot) => slot,
            None => {
                debug!(
                    "pid {} not among '{}' siblings, handles unavailable",
                    self.pid, image
                );
                return None;
            }
        };

        // Watch every sibling not already covered: any exit shifts the slot
        // indices, and one watcher per pid is enough. A failed attach degrades
        // re-resolution but does not stop current sampling.
        for sibling in &siblings {
            if self.watched.contains(sibling) {
                continue;
            }
            match self.directory.watch_exit(*sibling, self.events_tx.clone()) {
                Ok(()) => {
                    self.watched.insert(*sibling);
                }
                Err(e) => self.sink.emit(
                    Severity::Warning,
                    WATCHER_WARNING_EVENT_ID,
                    &format!(
                        "could not watch pid {} for exit, slot shifts may go unnoticed: {}",
                        sibling, e
                    ),
                ),
            }
        }

        let mut handles = match self.source.acquire(&slot, self.pid) {
            Ok(handles) => handles,
            Err(e) => {
                debug!("counter acquisition failed for slot '{}': {}", slot, e);
                return None;
            }
        };

        // First read of a fresh handle establishes its baseline
        let _ = handles.cpu.next_value();
        let _ = handles.private_bytes.next_value();
        let _ = handles.working_set.next_value();

        if !self.warmup.is_zero() {
            thread::sleep(self.warmup);
        }

        debug!("resolved counter handles for pid {} at slot '{}'", self.pid, slot);
        Some(handles)
    }
}

/// Derives the instrumentation slot name for a pid among its same-image
/// siblings: the first (lowest-pid) instance uses the bare image name, later
/// instances append `#N`.
fn instance_slot(image: &str, pid: u32, siblings: &[u32]) -> Option<String> {
    let mut sorted: Vec<u32> = siblings.to_vec();
    sorted.sort_unstable();
    let index = sorted.iter().position(|&p| p == pid)?;
    if index == 0 {
        Some(image.to_string())
    } else {
        Some(format!("{}#{}", image, index))
    }
}
