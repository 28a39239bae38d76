use std::fmt::{Display, Formatter};

/// Error taxonomy for the chat core.
///
/// `Aborted` is deliberately absent: a user-cancelled generation is a terminal
/// state that still commits partial output, not a failure.
#[derive(Debug)]
pub enum ChatError {
    /// Missing credential, unresolvable persona, invalid group configuration.
    /// Reported synchronously before any model call.
    Config(String),
    /// The model signalled a content-policy block; carries the specific reason.
    Blocked(String),
    /// Network or rate-limit failure; retryable.
    Transport(String),
    /// Persistence failure.
    Store(String),
    /// A generation is already in flight for this chat.
    Busy,
    Json(serde_json::Error),
    Sql(rusqlite::Error),
}

impl Display for ChatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::Config(s) => write!(f, "configuration error: {}", s),
            ChatError::Blocked(s) => write!(f, "response blocked: {}", s),
            ChatError::Transport(s) => write!(f, "transport error: {}", s),
            ChatError::Store(s) => write!(f, "store error: {}", s),
            ChatError::Busy => write!(f, "a generation is already in flight for this chat"),
            ChatError::Json(e) => write!(f, "{}", e),
            ChatError::Sql(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<serde_json::Error> for ChatError {
    fn from(value: serde_json::Error) -> Self {
        ChatError::Json(value)
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(value: rusqlite::Error) -> Self {
        ChatError::Sql(value)
    }
}

impl From<r2d2::Error> for ChatError {
    fn from(value: r2d2::Error) -> Self {
        ChatError::Store(value.to_string())
    }
}
