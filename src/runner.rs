//! Background batch runner
//!
//! A run owns one session for its whole lifetime and walks the recipient list
//! strictly in order on a single spawned task. Cancellation is cooperative and
//! only observed between recipients: an attempt in flight, including its own
//! retries, always runs to completion first.

use crate::config::Settings;
use crate::delivery::DeliveryTimings;
use crate::progress::{ProgressReporter, RunState};
use crate::recipients::{Attachment, Recipient};
use crate::retry::{deliver_with_retry, RecipientResult, RetryPolicy, Verdict};
use crate::session::{SessionBootstrap, SessionHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Caller errors when driving the runner
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    /// `start` was called while a previous run is still in progress
    #[error("A run is already in progress")]
    AlreadyRunning,
}

/// Engine parameters fixed for the duration of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Waits and pauses of each attempt
    pub timings: DeliveryTimings,
    /// Per-recipient retry policy
    pub policy: RetryPolicy,
    /// Ceiling for the login handshake
    pub login_timeout: Duration,
}

impl RunConfig {
    /// Derive the engine parameters from loaded settings
    #[must_use]
    pub const fn from_settings(settings: &Settings) -> Self {
        Self {
            timings: settings.delivery_timings(),
            policy: settings.retry_policy(),
            login_timeout: settings.login_timeout(),
        }
    }
}

/// What a finished run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Recipients delivered
    pub success: usize,
    /// Recipients that failed
    pub failure: usize,
    /// Recipients skipped for an empty contact
    pub skipped: usize,
    /// Stopped by the caller before the list was exhausted
    pub cancelled: bool,
    /// Session could not be opened or authenticated; nothing was attempted
    pub bootstrap_failed: bool,
    /// One entry per processed recipient, in order
    pub results: Vec<RecipientResult>,
}

impl RunSummary {
    /// Recipients that received a verdict
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.success + self.failure
    }
}

struct Inner {
    bootstrap: Arc<dyn SessionBootstrap>,
    config: RunConfig,
    reporter: ProgressReporter,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl Inner {
    fn cancel_slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running flag however the worker exits
struct RunGuard(Arc<Inner>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.reporter.finish();
        self.0.running.store(false, Ordering::Release);
    }
}

/// Runs batches of deliveries in the background
///
/// Cloning yields another handle to the same runner.
#[derive(Clone)]
pub struct BatchRunner {
    inner: Arc<Inner>,
}

impl BatchRunner {
    /// Create an idle runner
    #[must_use]
    pub fn new(bootstrap: Arc<dyn SessionBootstrap>, config: RunConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bootstrap,
                config,
                reporter: ProgressReporter::new(),
                cancel: Mutex::new(CancellationToken::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot of the current or last run
    #[must_use]
    pub fn progress(&self) -> RunState {
        self.inner.reporter.snapshot()
    }

    /// Shared reporter, e.g. to subscribe to changes
    #[must_use]
    pub fn reporter(&self) -> &ProgressReporter {
        &self.inner.reporter
    }

    /// Whether a worker is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Ask the current run to stop after the recipient in flight.
    ///
    /// Returns `false` when no run is in progress.
    pub fn stop(&self) -> bool {
        let token = self.inner.cancel_slot();
        if !self.is_running() {
            return false;
        }
        self.inner
            .reporter
            .info("Stop signal received. Halting after the current operation...");
        token.cancel();
        true
    }

    /// Start a run on a background task.
    ///
    /// The run state is reset before this returns, so an immediate
    /// [`BatchRunner::progress`] already reports the new run.
    ///
    /// # Errors
    ///
    /// Returns `RunError::AlreadyRunning` if a previous run has not finished.
    pub fn start(
        &self,
        recipients: Vec<Recipient>,
        attachment: Option<Attachment>,
    ) -> Result<JoinHandle<RunSummary>, RunError> {
        // Flag, token and state reset change under the cancel lock
        let token = {
            let mut slot = self.inner.cancel_slot();
            if self
                .inner
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(RunError::AlreadyRunning);
            }
            *slot = CancellationToken::new();
            self.inner.reporter.begin(recipients.len());
            slot.clone()
        };

        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let guard = RunGuard(Arc::clone(&inner));
            let summary = execute(&inner, &recipients, attachment.as_ref(), &token).await;
            drop(guard);
            summary
        }))
    }
}

#[instrument(skip_all, fields(total = recipients.len()))]
async fn execute(
    inner: &Inner,
    recipients: &[Recipient],
    attachment: Option<&Attachment>,
    token: &CancellationToken,
) -> RunSummary {
    let reporter = &inner.reporter;
    let config = &inner.config;
    let mut summary = RunSummary::default();

    reporter.info(format!(
        "Starting to process {} recipients...",
        recipients.len()
    ));

    let Some(mut session) = bootstrap(inner).await else {
        reporter.error("Setup failed. Halting process.");
        summary.bootstrap_failed = true;
        return summary;
    };

    for (index, recipient) in recipients.iter().enumerate() {
        if token.is_cancelled() {
            reporter.info("Process stopped by user.");
            summary.cancelled = true;
            break;
        }
        if !recipient.has_contact() {
            debug!(index, "Skipping recipient without contact");
            summary.skipped += 1;
            continue;
        }

        reporter.set_current(index + 1);
        let result = deliver_with_retry(
            session.as_ref(),
            recipient,
            attachment,
            &config.timings,
            &config.policy,
            reporter,
        )
        .await;

        reporter.record(result.verdict);
        match result.verdict {
            Verdict::Success => summary.success += 1,
            Verdict::Failure => summary.failure += 1,
        }
        summary.results.push(result);
    }

    let verb = if summary.cancelled { "stopped" } else { "completed" };
    reporter.info(format!(
        "Process {verb}! Success: {}, Failed: {}",
        summary.success, summary.failure
    ));
    release(session.as_mut(), reporter).await;
    info!(
        success = summary.success,
        failure = summary.failure,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "Run finished"
    );
    summary
}

/// Open and authenticate a session; releases it again if login fails.
async fn bootstrap(inner: &Inner) -> Option<Box<dyn SessionHandle>> {
    let reporter = &inner.reporter;

    reporter.info("Initializing browser session...");
    let mut session = match inner.bootstrap.open().await {
        Ok(session) => session,
        Err(e) => {
            reporter.error(format!("Failed to initialize session: {e}"));
            return None;
        }
    };
    reporter.info("Browser session initialized.");

    reporter.info("Connecting to messaging service, scan the QR code if prompted...");
    if !inner
        .bootstrap
        .authenticate(session.as_ref(), inner.config.login_timeout)
        .await
    {
        reporter.error("Login timed out. Restart the run and try again.");
        release(session.as_mut(), reporter).await;
        return None;
    }
    reporter.info("Logged in.");
    Some(session)
}

async fn release(session: &mut dyn SessionHandle, reporter: &ProgressReporter) {
    if let Err(e) = session.close().await {
        reporter.warn(format!("Failed to release browser session: {e}"));
    }
}
