//! Per-recipient delivery state machine
//!
//! One call to [`attempt_delivery`] walks a recipient through
//! `ChatOpening → ChatReady → ContentInjecting → SendConfirming` and folds every
//! error into [`AttemptOutcome::TransientFailure`], so a broken page can never
//! take the whole batch down.

use crate::progress::ProgressReporter;
use crate::recipients::{Attachment, Recipient};
use crate::session::{Element, Key, SessionError, SessionHandle, Signal};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Waits and pauses of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTimings {
    /// Ceiling for the conversation and its controls to appear
    pub chat_load: Duration,
    /// Ceiling for an attachment upload to finish
    pub upload: Duration,
    /// How long to watch for the compose box after sending
    pub send_confirmation: Duration,
    /// Courtesy pause after every send
    pub inter_message: Duration,
}

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Message left the compose box (or confirmation was merely not observed)
    Delivered,
    /// Contact is not registered on the surface; retrying cannot help
    InvalidRecipient,
    /// Anything else; eligible for retry
    TransientFailure(String),
}

impl AttemptOutcome {
    /// Whether another attempt could change the result
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure(_))
    }
}

/// Non-terminal states of the machine, used for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Navigating to the conversation
    ChatOpening,
    /// Conversation open, compose box located
    ChatReady,
    /// Typing text or uploading the attachment
    ContentInjecting,
    /// Watching for the compose box to settle
    SendConfirming,
}

impl fmt::Display for DeliveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChatOpening => "chat-opening",
            Self::ChatReady => "chat-ready",
            Self::ContentInjecting => "content-injecting",
            Self::SendConfirming => "send-confirming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
enum DeliveryError {
    #[error("input not found")]
    InputNotFound,
    #[error("attachment upload timed out")]
    UploadTimeout,
    #[error("{0} not found")]
    Missing(Signal),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Run one delivery attempt for `recipient`.
///
/// Never fails: unexpected conditions become
/// [`AttemptOutcome::TransientFailure`] with a readable reason, and every
/// outcome is written to the run log.
#[instrument(skip_all, fields(contact = %recipient.contact))]
pub async fn attempt_delivery(
    session: &dyn SessionHandle,
    recipient: &Recipient,
    attachment: Option<&Attachment>,
    timings: &DeliveryTimings,
    reporter: &ProgressReporter,
) -> AttemptOutcome {
    match run_attempt(session, recipient, attachment, timings, reporter).await {
        Ok(outcome) => outcome,
        Err(DeliveryError::InputNotFound) => {
            reporter.error(format!(
                "Error: Could not find message input area for {}",
                recipient.contact
            ));
            AttemptOutcome::TransientFailure(DeliveryError::InputNotFound.to_string())
        }
        Err(e) => {
            reporter.error(format!("Error sending to {}: {e}", recipient.contact));
            AttemptOutcome::TransientFailure(e.to_string())
        }
    }
}

async fn run_attempt(
    session: &dyn SessionHandle,
    recipient: &Recipient,
    attachment: Option<&Attachment>,
    timings: &DeliveryTimings,
    reporter: &ProgressReporter,
) -> Result<AttemptOutcome, DeliveryError> {
    let contact = recipient.contact.as_str();

    debug!(phase = %DeliveryPhase::ChatOpening);
    reporter.info(format!("Opening chat with {contact}..."));
    session.navigate(contact).await?;

    let opened = session
        .wait_for_any(&[Signal::InputReady, Signal::InvalidNumber], timings.chat_load)
        .await?;
    if opened.is_none() {
        reporter.warn("Chat loading timed out, proceeding anyway");
    }

    // Both signals can race; look again whatever fired.
    if !session.find_all(Signal::InvalidNumber).await?.is_empty() {
        reporter.error(format!("Error: {contact} is not registered on the messaging service"));
        return Ok(AttemptOutcome::InvalidRecipient);
    }

    let input = session
        .wait_interactable(Signal::InputReady, timings.chat_load)
        .await?
        .ok_or(DeliveryError::InputNotFound)?;
    debug!(phase = %DeliveryPhase::ChatReady);

    debug!(phase = %DeliveryPhase::ContentInjecting);
    if let Some(attachment) = attachment {
        send_attachment(session, attachment, &recipient.message, timings, reporter).await?;
    } else if !recipient.message.is_empty() {
        send_text(session, &input, &recipient.message, timings).await?;
    } else {
        debug!("Nothing to inject, chat opened only");
    }

    debug!(phase = %DeliveryPhase::SendConfirming);
    let confirmed = session
        .wait_for_any(&[Signal::InputReady], timings.send_confirmation)
        .await?;
    if confirmed.is_some() {
        reporter.info(format!("✓ Message sent successfully to {contact}"));
    } else {
        // Missing confirmation is common and not proof of failure.
        reporter.warn(format!(
            "Warning: Message send confirmation not detected for {contact}"
        ));
    }
    Ok(AttemptOutcome::Delivered)
}

/// Clear the compose box, type line by line, submit after the last line.
async fn send_text(
    session: &dyn SessionHandle,
    input: &Element,
    message: &str,
    timings: &DeliveryTimings,
) -> Result<(), DeliveryError> {
    // The box may be pre-filled, e.g. with a quoted reply
    session.send_keys(input, Key::SelectAll).await?;
    session.send_keys(input, Key::Delete).await?;

    let mut lines = message.lines().peekable();
    while let Some(line) = lines.next() {
        if !line.is_empty() {
            session.type_text(input, line).await?;
        }
        let key = if lines.peek().is_some() {
            Key::SoftNewline
        } else {
            Key::Submit
        };
        session.send_keys(input, key).await?;
    }

    tokio::time::sleep(timings.inter_message).await;
    Ok(())
}

async fn first_of(session: &dyn SessionHandle, signal: Signal) -> Result<Element, DeliveryError> {
    session
        .find_all(signal)
        .await?
        .into_iter()
        .next()
        .ok_or(DeliveryError::Missing(signal))
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}

async fn send_attachment(
    session: &dyn SessionHandle,
    attachment: &Attachment,
    caption: &str,
    timings: &DeliveryTimings,
    reporter: &ProgressReporter,
) -> Result<(), DeliveryError> {
    let attach = session
        .wait_interactable(Signal::AttachButton, timings.chat_load)
        .await?
        .ok_or(DeliveryError::Missing(Signal::AttachButton))?;
    session.click(&attach).await?;

    let file_input = first_of(session, Signal::FileInput).await?;
    let path = absolute_path(&attachment.path);
    session
        .type_text(&file_input, &path.to_string_lossy())
        .await?;

    let uploaded = session
        .wait_for_any(&[Signal::UploadSend], timings.upload)
        .await?;
    if uploaded.is_none() {
        reporter.error("Error: Attachment upload took too long");
        cancel_upload(session, reporter).await;
        return Err(DeliveryError::UploadTimeout);
    }

    if attachment.supports_caption() && !caption.is_empty() {
        let caption_box = first_of(session, Signal::CaptionBox).await?;
        session.type_text(&caption_box, caption).await?;
    }

    let send = first_of(session, Signal::UploadSend).await?;
    session.click(&send).await?;

    tokio::time::sleep(timings.inter_message).await;
    Ok(())
}

/// Best effort: leave no half-uploaded preview behind.
async fn cancel_upload(session: &dyn SessionHandle, reporter: &ProgressReporter) {
    let cancel = match session.find_all(Signal::UploadCancel).await {
        Ok(found) => found.into_iter().next(),
        Err(e) => {
            warn!(error = %e, "Failed to locate upload cancel control");
            None
        }
    };
    let Some(cancel) = cancel else {
        reporter.warn("Could not cancel pending upload: close control not found");
        return;
    };
    match session.click(&cancel).await {
        Ok(()) => reporter.info("Attachment upload cancelled"),
        Err(e) => reporter.warn(format!("Could not cancel pending upload: {e}")),
    }
}
