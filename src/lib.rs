#![deny(missing_docs)]
//! Bulk Courier library.
//!
//! Resumable, cancellable batch delivery of messages and attachments through a
//! browser-driven messaging surface.

/// Configuration management.
pub mod config;
/// Per-recipient delivery state machine.
pub mod delivery;
/// Run state, run log and observer snapshots.
pub mod progress;
/// Recipient and attachment ingestion.
pub mod recipients;
/// Bounded retry around a single recipient.
pub mod retry;
/// Background batch runner.
pub mod runner;
/// Session handle abstraction and WebDriver adapter.
pub mod session;

pub use delivery::{attempt_delivery, AttemptOutcome, DeliveryTimings};
pub use progress::{LogLevel, ProgressReporter, RunState};
pub use recipients::{Attachment, AttachmentKind, Recipient};
pub use retry::{deliver_with_retry, RecipientResult, RetryPolicy, Verdict};
pub use runner::{BatchRunner, RunConfig, RunError, RunSummary};
pub use session::{
    BootstrapError, Element, Key, SessionBootstrap, SessionError, SessionHandle, Signal,
};
