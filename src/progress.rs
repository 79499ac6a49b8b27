//! Run state and progress reporting
//!
//! The batch runner is the only writer. It publishes every mutation through a
//! `watch` channel, so observers always read a complete snapshot and never
//! block the worker for longer than a clone.

use crate::retry::Verdict;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Severity of a run-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Normal progress
    Info,
    /// Recoverable problem, e.g. a failed attempt that will be retried
    Warn,
    /// Recipient or run failure
    Error,
}

/// One timestamped line of the run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Local wall-clock time, `HH:MM:SS`
    pub timestamp: String,
    /// Severity
    pub level: LogLevel,
    /// Human-readable text
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp, self.message)
    }
}

/// Snapshot of a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Whether a run is in progress
    pub active: bool,
    /// 1-based position of the recipient being processed, 0 before the first
    pub current_index: usize,
    /// Number of recipients handed to the run
    pub total: usize,
    /// Recipients delivered
    pub success_count: usize,
    /// Recipients that ended in failure
    pub failure_count: usize,
    /// Run log, oldest first
    pub log: Vec<LogEntry>,
}

impl RunState {
    /// Recipients with a verdict so far
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.success_count + self.failure_count
    }
}

/// Shared publisher of [`RunState`]
///
/// Cloning is cheap; all clones publish to and read from the same state.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<RunState>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// Create a reporter holding an idle, empty state
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the latest published state
    #[must_use]
    pub fn snapshot(&self) -> RunState {
        self.tx.borrow().clone()
    }

    /// Last `n` log lines, formatted for display
    #[must_use]
    pub fn log_tail(&self, n: usize) -> Vec<String> {
        let state = self.tx.borrow();
        let skip = state.log.len().saturating_sub(n);
        state.log.iter().skip(skip).map(ToString::to_string).collect()
    }

    /// Receiver notified on every published change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// Append a log line and mirror it to tracing
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(target: "bulk_courier::run_log", "{message}"),
            LogLevel::Warn => warn!(target: "bulk_courier::run_log", "{message}"),
            LogLevel::Error => error!(target: "bulk_courier::run_log", "{message}"),
        }
        let entry = LogEntry {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            level,
            message,
        };
        self.tx.send_modify(|state| state.log.push(entry));
    }

    /// Shorthand for an info line
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Shorthand for a warning line
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    /// Shorthand for an error line
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Start a fresh run of `total` recipients
    pub(crate) fn begin(&self, total: usize) {
        self.tx.send_modify(|state| {
            *state = RunState {
                active: true,
                total,
                ..RunState::default()
            };
        });
    }

    /// Mark the 1-based `index` as the recipient in flight
    pub(crate) fn set_current(&self, index: usize) {
        self.tx.send_modify(|state| state.current_index = index);
    }

    /// Count one recipient verdict
    pub(crate) fn record(&self, verdict: Verdict) {
        self.tx.send_modify(|state| match verdict {
            Verdict::Success => state.success_count += 1,
            Verdict::Failure => state.failure_count += 1,
        });
    }

    /// Mark the run as no longer active
    pub(crate) fn finish(&self) {
        self.tx.send_modify(|state| state.active = false);
    }
}
