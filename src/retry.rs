//! Bounded retry around a single recipient
//!
//! Attempts are spaced by a fixed backoff. `InvalidRecipient` and `Delivered`
//! stop the loop immediately; only transient failures are retried.

use crate::delivery::{attempt_delivery, AttemptOutcome, DeliveryTimings};
use crate::progress::ProgressReporter;
use crate::recipients::{Attachment, Recipient};
use crate::session::SessionHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

/// Final classification of a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Delivered
    Success,
    /// Invalid, or every attempt failed
    Failure,
}

/// Outcome of all attempts for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientResult {
    /// Normalized contact
    pub contact: String,
    /// Success or failure
    pub verdict: Verdict,
    /// Attempts actually made
    pub attempts: u32,
    /// Outcome of the last attempt
    pub last_outcome: AttemptOutcome,
}

/// How many times and how far apart to try one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    /// Pause between a failed attempt and the next one
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            backoff: Duration::from_secs(crate::config::DEFAULT_RETRY_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    /// Drive `attempt` until it delivers, hits a non-retryable outcome, or
    /// runs out of attempts.
    ///
    /// `attempt` receives the 1-based attempt number. The backoff sleep happens
    /// between attempts only, never after the last one.
    pub async fn run<F, Fut>(
        &self,
        contact: &str,
        reporter: &ProgressReporter,
        mut attempt: F,
    ) -> RecipientResult
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let max = self.max_retries.max(1);
        let strategy = FixedInterval::new(self.backoff).take(max as usize - 1);
        let mut made = 0u32;

        let result = RetryIf::start(
            strategy,
            || {
                made += 1;
                let number = made;
                reporter.info(format!(
                    "Attempting to send message to {contact} (attempt {number}/{max})..."
                ));
                let pending = attempt(number);
                async move {
                    match pending.await {
                        AttemptOutcome::Delivered => Ok(()),
                        AttemptOutcome::InvalidRecipient => {
                            reporter.error(format!(
                                "{contact} is not registered, not retrying"
                            ));
                            Err(AttemptOutcome::InvalidRecipient)
                        }
                        AttemptOutcome::TransientFailure(reason) => {
                            if number < max {
                                reporter.warn(format!(
                                    "Attempt {number} failed for {contact}: {reason}. Retrying..."
                                ));
                            } else {
                                reporter.warn(format!(
                                    "Attempt {number} failed for {contact}: {reason}"
                                ));
                            }
                            Err(AttemptOutcome::TransientFailure(reason))
                        }
                    }
                }
            },
            AttemptOutcome::is_retryable,
        )
        .await;

        match result {
            Ok(()) => RecipientResult {
                contact: contact.to_string(),
                verdict: Verdict::Success,
                attempts: made,
                last_outcome: AttemptOutcome::Delivered,
            },
            Err(outcome) => {
                if outcome.is_retryable() {
                    reporter.error(format!("All retries failed for contact {contact}."));
                }
                RecipientResult {
                    contact: contact.to_string(),
                    verdict: Verdict::Failure,
                    attempts: made,
                    last_outcome: outcome,
                }
            }
        }
    }
}

/// Deliver to one recipient under `policy`
pub async fn deliver_with_retry(
    session: &dyn SessionHandle,
    recipient: &Recipient,
    attachment: Option<&Attachment>,
    timings: &DeliveryTimings,
    policy: &RetryPolicy,
    reporter: &ProgressReporter,
) -> RecipientResult {
    policy
        .run(&recipient.contact, reporter, |_| {
            attempt_delivery(session, recipient, attachment, timings, reporter)
        })
        .await
}
