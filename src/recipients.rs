//! Recipient and attachment ingestion
//!
//! Turns a JSON table export into normalized [`Recipient`]s and validates the
//! optional attachment before a run starts.

// lazy_regex! statics are validated at compile time
#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Everything that is not a digit
static RE_NON_DIGIT: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\D");

/// Header fragments that identify the contact column
const CONTACT_KEYWORDS: &[&str] = &["contact", "phone", "number"];

/// Header of the message column, matched case-insensitively
const MESSAGE_HEADER: &str = "message";

/// Errors raised while loading recipients or the attachment
#[derive(Debug, Error)]
pub enum LoadError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// File is not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON is valid but not an array of row objects
    #[error("Expected an array of row objects")]
    NotATable,
    /// No row carries any column
    #[error("Recipient table has no columns")]
    NoColumns,
    /// Attachment path is not a regular file
    #[error("Attachment {0} is not a file")]
    NotAFile(PathBuf),
    /// Attachment exceeds the configured size limit
    #[error("Attachment {path} is {size} bytes, limit is {max}")]
    TooLarge {
        /// Offending path
        path: PathBuf,
        /// Actual size in bytes
        size: u64,
        /// Configured limit in bytes
        max: u64,
    },
}

/// Strips every non-digit character from a raw contact value.
///
/// # Examples
///
/// ```
/// use bulk_courier::recipients::normalize_contact;
/// assert_eq!(normalize_contact("+91 (999) 999-9999"), "919999999999");
/// ```
#[must_use]
pub fn normalize_contact(raw: &str) -> String {
    RE_NON_DIGIT.replace_all(raw, "").into_owned()
}

/// One destination and its message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Normalized digit string
    pub contact: String,
    /// Message text, possibly empty
    pub message: String,
}

impl Recipient {
    /// Build a recipient, normalizing the contact and trimming the message
    #[must_use]
    pub fn new(contact: &str, message: &str) -> Self {
        Self {
            contact: normalize_contact(contact),
            message: message.trim().to_string(),
        }
    }

    /// Whether the contact survived normalization
    #[must_use]
    pub fn has_contact(&self) -> bool {
        !self.contact.is_empty()
    }
}

/// Result of contact column detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPick {
    /// Chosen header
    pub header: String,
    /// `true` when no header matched and the first one was used
    pub fallback: bool,
}

/// Pick the column holding contact numbers.
///
/// The first header containing `contact`, `phone` or `number` wins; otherwise
/// the first header is used and `fallback` is set. `None` only for no headers.
#[must_use]
pub fn detect_contact_column(headers: &[String]) -> Option<ColumnPick> {
    headers
        .iter()
        .find(|h| {
            let lowered = h.trim().to_lowercase();
            CONTACT_KEYWORDS.iter().any(|k| lowered.contains(k))
        })
        .map(|h| ColumnPick {
            header: h.clone(),
            fallback: false,
        })
        .or_else(|| {
            headers.first().map(|h| ColumnPick {
                header: h.clone(),
                fallback: true,
            })
        })
}

/// Recipients read from a table plus what the caller should report
#[derive(Debug, Clone)]
pub struct LoadedRecipients {
    /// Rows with a usable contact, in file order
    pub recipients: Vec<Recipient>,
    /// Header used for contacts
    pub contact_column: String,
    /// Rows dropped for an empty contact
    pub dropped: usize,
    /// Non-fatal problems, e.g. a contact column fallback
    pub warnings: Vec<String>,
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn collect_headers(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for key in rows.iter().flat_map(Map::keys) {
        if !headers.iter().any(|h| h == key) {
            headers.push(key.clone());
        }
    }
    headers
}

/// Parse a JSON array of row objects into recipients.
///
/// # Errors
///
/// Returns `LoadError` if the input is not a JSON array of objects or has no columns.
pub fn parse_recipients(json: &str) -> Result<LoadedRecipients, LoadError> {
    let Value::Array(items) = serde_json::from_str::<Value>(json)? else {
        return Err(LoadError::NotATable);
    };
    let rows = items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(LoadError::NotATable),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let headers = collect_headers(&rows);
    let pick = detect_contact_column(&headers).ok_or(LoadError::NoColumns)?;
    let message_header = headers
        .iter()
        .find(|h| h.trim().eq_ignore_ascii_case(MESSAGE_HEADER))
        .cloned();

    let mut warnings = Vec::new();
    if pick.fallback {
        warnings.push(format!(
            "No 'contact' column found. Using first column '{}'.",
            pick.header
        ));
    }
    if message_header.is_none() {
        debug!("No message column, sending empty messages");
    }

    let mut recipients = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in &rows {
        let message = message_header
            .as_ref()
            .map(|h| cell_text(row.get(h)))
            .unwrap_or_default();
        let recipient = Recipient::new(&cell_text(row.get(&pick.header)), &message);
        if recipient.has_contact() {
            recipients.push(recipient);
        } else {
            dropped += 1;
        }
    }

    Ok(LoadedRecipients {
        recipients,
        contact_column: pick.header,
        dropped,
        warnings,
    })
}

/// Load recipients from a JSON table file
///
/// # Errors
///
/// Returns `LoadError::Io` if the file cannot be read, otherwise see [`parse_recipients`].
pub fn load_recipients(path: &Path) -> Result<LoadedRecipients, LoadError> {
    let json = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let loaded = parse_recipients(&json)?;
    for warning in &loaded.warnings {
        warn!(path = %path.display(), "{warning}");
    }
    Ok(loaded)
}

/// Broad file category, inferred from the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// jpg, jpeg, png, gif
    Image,
    /// mp4
    Video,
    /// pdf, doc, docx, xls, xlsx, txt
    Document,
    /// Anything else
    Other,
}

impl AttachmentKind {
    /// Infer the kind from a file name
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" => Self::Image,
            "mp4" => Self::Video,
            "pdf" | "doc" | "docx" | "xls" | "xlsx" | "txt" => Self::Document,
            _ => Self::Other,
        }
    }

    /// Whether the upload preview offers a caption box
    #[must_use]
    pub const fn supports_caption(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// File sent to every recipient of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Absolute path
    pub path: PathBuf,
    /// Inferred category
    pub kind: AttachmentKind,
}

impl Attachment {
    /// Describe a file without touching the filesystem
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = AttachmentKind::from_path(&path);
        Self { path, kind }
    }

    /// Validate a file on disk and resolve it to an absolute path
    ///
    /// # Errors
    ///
    /// Returns `LoadError` if the file is missing, not a regular file, or larger
    /// than `max_file_size` bytes.
    pub fn from_path(path: &Path, max_file_size: u64) -> Result<Self, LoadError> {
        let io_err = |source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        };
        let absolute = path.canonicalize().map_err(io_err)?;
        let meta = std::fs::metadata(&absolute).map_err(io_err)?;
        if !meta.is_file() {
            return Err(LoadError::NotAFile(absolute));
        }
        if meta.len() > max_file_size {
            return Err(LoadError::TooLarge {
                path: absolute,
                size: meta.len(),
                max: max_file_size,
            });
        }
        Ok(Self::new(absolute))
    }

    /// Whether a caption can accompany this file
    #[must_use]
    pub const fn supports_caption(&self) -> bool {
        self.kind.supports_caption()
    }
}
