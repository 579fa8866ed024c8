//! Error types for confab-engine

use thiserror::Error;

/// Result type alias using confab-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the engine
#[derive(Error, Debug)]
pub enum Error {
    /// The engine task has shut down
    #[error("engine is closed")]
    Closed,
}

/// Fallback text when the server supplied no user-visible message.
pub(crate) const GENERIC_ERROR: &str = "Something went wrong. Please try again.";

/// User-facing text for a terminal send failure.
pub(crate) fn user_message_for(error: &confab_wire::Error) -> &'static str {
    match error.status() {
        Some(410) => "This conversation can no longer continue. Please start a new one.",
        Some(413) => "That message is too long to send.",
        Some(429) => "You are sending messages too quickly. Please try again later.",
        _ => GENERIC_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(user_message_for(&confab_wire::Error::Status(410)).contains("start a new one"));
        assert!(user_message_for(&confab_wire::Error::Status(413)).contains("too long"));
        assert!(user_message_for(&confab_wire::Error::Status(429)).contains("too quickly"));
    }

    #[test]
    fn test_other_failures_map_to_generic_text() {
        assert_eq!(user_message_for(&confab_wire::Error::Status(500)), GENERIC_ERROR);
        let decode = confab_wire::Error::InvalidChatUpdate { frame: "{}".into() };
        assert_eq!(user_message_for(&decode), GENERIC_ERROR);
    }
}
