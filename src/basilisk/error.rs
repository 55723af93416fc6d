//! Crate-wide error type.
//!
//! Every fallible operation in the engine returns [`BasiliskError`].  The
//! variants are deliberately coarse: they describe *what kind* of failure
//! occurred (credentials, transport, storage, …) rather than which provider or
//! subsystem produced it, so the UI can pick a presentation per kind without
//! knowing about adapters.

use std::error::Error;
use std::fmt;

use regex::Regex;

lazy_static::lazy_static! {
    static ref URL_IN_TEXT: Regex =
        Regex::new(r"https?://[^\s<>\)\]'\x22]+").expect("valid URL regex");
}

/// Engine-wide error kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum BasiliskError {
    /// Missing or invalid API key, surfaced at engine creation or first call.
    Credential(String),
    /// The selected engine does not advertise the requested capability.
    Capability(String),
    /// Network or HTTP failure.  `url` is surfaced to the UI as clickable
    /// when present.
    Transport {
        message: String,
        url: Option<String>,
    },
    /// Refusal, malformed content, or an empty response body where content
    /// was required.
    Content(String),
    /// Cooperative cancellation.  Not a failure; never logged as one.
    Cancelled,
    /// Malformed archive, unknown version, zip corruption.
    Storage(String),
    /// Invalid profile or account configuration.
    Config(String),
    /// A completion is already running for this conversation.
    Busy,
}

impl BasiliskError {
    /// Shorthand for a transport error without an associated URL.
    pub fn transport(message: impl Into<String>) -> Self {
        BasiliskError::Transport {
            message: message.into(),
            url: None,
        }
    }

    /// True for [`BasiliskError::Cancelled`], which callers treat as a normal
    /// outcome rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BasiliskError::Cancelled)
    }
}

impl fmt::Display for BasiliskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasiliskError::Credential(msg) => write!(f, "credential error: {}", msg),
            BasiliskError::Capability(msg) => write!(f, "capability not available: {}", msg),
            BasiliskError::Transport { message, url } => match url {
                Some(url) => write!(f, "transport error: {} ({})", message, url),
                None => write!(f, "transport error: {}", message),
            },
            BasiliskError::Content(msg) => write!(f, "content error: {}", msg),
            BasiliskError::Cancelled => write!(f, "operation cancelled"),
            BasiliskError::Storage(msg) => write!(f, "storage error: {}", msg),
            BasiliskError::Config(msg) => write!(f, "configuration error: {}", msg),
            BasiliskError::Busy => write!(f, "a completion is already running"),
        }
    }
}

impl Error for BasiliskError {}

impl From<reqwest::Error> for BasiliskError {
    fn from(err: reqwest::Error) -> Self {
        BasiliskError::Transport {
            message: err.to_string(),
            url: err.url().map(|u| u.to_string()),
        }
    }
}

impl From<std::io::Error> for BasiliskError {
    fn from(err: std::io::Error) -> Self {
        BasiliskError::Storage(err.to_string())
    }
}

impl From<zip::result::ZipError> for BasiliskError {
    fn from(err: zip::result::ZipError) -> Self {
        BasiliskError::Storage(err.to_string())
    }
}

/// Extract the `http(s)` URLs embedded in an error message.
///
/// Pure text scan with no UI coupling; the enhanced error view turns the
/// returned URLs into clickable links.
pub fn find_urls(text: &str) -> Vec<String> {
    URL_IN_TEXT
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .collect()
}
