//! Counter source and process directory abstractions.
//!
//! The collector itself never talks to the operating system directly; it goes
//! through these traits. The production implementations live in
//! [`proc`] and read the Linux /proc filesystem; tests inject in-memory
//! fakes, including synthetic exit events for re-resolution.

pub mod proc;

use std::fmt;
use std::sync::mpsc::Sender;

use thiserror::Error;

use crate::sample::IoSnapshot;

/// Identity of the monitored process: its pid and the owner label used for
/// directory and file naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub owner: String,
}

impl ProcessIdentity {
    pub fn new(pid: u32, owner: impl Into<String>) -> Self {
        Self {
            pid,
            owner: owner.into(),
        }
    }

    /// File-name prefix for this process's window files: `<owner>_<pid>`.
    pub fn file_prefix(&self) -> String {
        format!("{}_{}", self.owner, self.pid)
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.owner, self.pid)
    }
}

/// Errors from counter acquisition, counter reads, and process lookups.
#[derive(Debug, Error)]
pub enum CounterError {
    /// A counter read failed mid-run, commonly because the process exited.
    #[error("counter read failed: {0}")]
    Read(String),

    /// The instrumentation slot for the process could not be determined.
    #[error("instrumentation slot unavailable for pid {0}")]
    SlotUnavailable(u32),

    /// An exit watcher could not be attached to a sibling process.
    #[error("exit watcher attach failed for pid {pid}: {reason}")]
    Watch { pid: u32, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A live binding to one scalar resource counter of one process.
pub trait CounterHandle: Send {
    /// Pulls the next reading. The first reading after acquisition
    /// establishes a baseline and should be discarded by the caller.
    fn next_value(&mut self) -> Result<f64, CounterError>;
}

/// The three instrumentation handles bound to one process instance slot.
pub struct HandleSet {
    pub cpu: Box<dyn CounterHandle>,
    pub private_bytes: Box<dyn CounterHandle>,
    pub working_set: Box<dyn CounterHandle>,
}

/// Source of instrumentation handles and disk/network counter snapshots.
pub trait CounterSource: Send + Sync {
    /// Acquires CPU, private-memory, and working-set handles bound to the
    /// given instance slot.
    fn acquire(&self, slot: &str, pid: u32) -> Result<HandleSet, CounterError>;

    /// Best-effort snapshot of disk and network counters for the process,
    /// or `None` if the data is unavailable right now.
    fn io_snapshot(&self, pid: u32) -> Option<IoSnapshot>;
}

/// Notification that a watched process has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: u32,
}

/// Lookup of process names and same-image siblings, plus exit watching.
pub trait ProcessDirectory: Send + Sync {
    /// Image name for a pid, or `None` if the process cannot be found.
    fn image_name(&self, pid: u32) -> Option<String>;

    /// Pids of all live processes sharing the given image name, including
    /// the monitored process itself.
    fn siblings(&self, image_name: &str) -> Vec<u32>;

    /// Arranges for an [`ExitEvent`] to be sent when the process exits.
    fn watch_exit(&self, pid: u32, notify: Sender<ExitEvent>) -> Result<(), CounterError>;
}
