//! Error types for confab-wire

use thiserror::Error;

/// Result type alias using confab-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while talking to the chat service
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed before or during body delivery
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Response body contained bytes that are not valid UTF-8
    #[error("invalid UTF-8 in response body")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A frame matched none of the known update schemas
    #[error("invalid chat update: {frame}")]
    InvalidChatUpdate { frame: String },

    /// The session was cancelled by its owner
    #[error("request aborted")]
    Aborted,
}

impl Error {
    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status(code) => Some(*code),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this error is a deliberate cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
