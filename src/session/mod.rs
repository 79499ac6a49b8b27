//! Session handle abstraction
//!
//! The delivery state machine only ever talks to the messaging surface through
//! [`SessionHandle`]. Every observation is a bounded poll; nothing here blocks
//! without a ceiling.

/// W3C WebDriver adapter backed by a running chromedriver.
pub mod webdriver;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use webdriver::{ChromeBootstrap, WebDriverSession};

/// Errors raised by a live session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport-level failure talking to the driver
    #[error("Transport error: {0}")]
    Transport(String),
    /// Driver answered with a WebDriver error payload
    #[error("Driver error ({error}): {message}")]
    Driver {
        /// WebDriver error code, e.g. `no such element`
        error: String,
        /// Human-readable message from the driver
        message: String,
    },
    /// Driver answered with something that is not a WebDriver response
    #[error("Malformed driver response: {0}")]
    Protocol(String),
    /// Operation attempted after the session was closed
    #[error("Session already closed")]
    Closed,
}

/// Errors raised while bringing a session up
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Browser/driver could not be started
    #[error("Failed to open browser session: {0}")]
    Open(#[from] SessionError),
}

/// Externally observable UI conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Conversation list, present once logged in
    ChatList,
    /// Compose box of an open conversation
    InputReady,
    /// Popup shown when a number is not registered
    InvalidNumber,
    /// Paper-clip button opening the attachment picker
    AttachButton,
    /// Hidden `<input type=file>` of the picker
    FileInput,
    /// Send button on the attachment preview
    UploadSend,
    /// Close button on the attachment preview
    UploadCancel,
    /// Caption box on the attachment preview
    CaptionBox,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChatList => "chat list",
            Self::InputReady => "message input",
            Self::InvalidNumber => "invalid number popup",
            Self::AttachButton => "attach button",
            Self::FileInput => "file input",
            Self::UploadSend => "upload send button",
            Self::UploadCancel => "upload cancel button",
            Self::CaptionBox => "caption box",
        };
        f.write_str(name)
    }
}

/// Key actions sent to a control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Select everything in the control
    SelectAll,
    /// Delete the selection
    Delete,
    /// Line break without submitting
    SoftNewline,
    /// Submit the compose box
    Submit,
}

/// Opaque reference to a located control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element(pub String);

impl Element {
    /// Driver-side identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Handle to an authenticated connection to the messaging surface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Open the conversation for a normalized contact
    async fn navigate(&self, contact: &str) -> Result<(), SessionError>;

    /// Wait until any of `signals` is present; `None` on timeout.
    ///
    /// The returned signal is only a hint: callers must re-check state with
    /// [`SessionHandle::find_all`] before acting on it.
    async fn wait_for_any(
        &self,
        signals: &[Signal],
        timeout: Duration,
    ) -> Result<Option<Signal>, SessionError>;

    /// Wait until `signal` is displayed and enabled; `None` on timeout.
    async fn wait_interactable(
        &self,
        signal: Signal,
        timeout: Duration,
    ) -> Result<Option<Element>, SessionError>;

    /// All elements currently matching `signal` (possibly empty)
    async fn find_all(&self, signal: Signal) -> Result<Vec<Element>, SessionError>;

    /// Click a control
    async fn click(&self, element: &Element) -> Result<(), SessionError>;

    /// Type literal text into a control
    async fn type_text(&self, element: &Element, text: &str) -> Result<(), SessionError>;

    /// Send a key action to a control
    async fn send_keys(&self, element: &Element, key: Key) -> Result<(), SessionError>;

    /// Release the underlying browser session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Brings up and authenticates sessions, once per run
#[async_trait]
pub trait SessionBootstrap: Send + Sync {
    /// Start a fresh, unauthenticated session
    async fn open(&self) -> Result<Box<dyn SessionHandle>, BootstrapError>;

    /// Drive the session to the logged-in state within `timeout`
    async fn authenticate(&self, session: &dyn SessionHandle, timeout: Duration) -> bool;
}
