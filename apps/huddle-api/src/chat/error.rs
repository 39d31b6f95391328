use std::fmt;

use thiserror::Error;

use crate::auth::AuthError;

/// Terminal cause attached to a closed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away or asked to disconnect.
    Disconnected,
    /// The session's outbound queue overflowed and it was evicted.
    BackpressureExceeded,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Disconnected => "disconnected",
            CloseReason::BackpressureExceeded => "backpressure_exceeded",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation failures. None of these affect other sessions or the room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("message text is empty")]
    EmptyText,
    #[error("message text exceeds {max} characters")]
    TextTooLong { max: usize },
    #[error("session has not joined a room")]
    NotJoined,
    #[error("room id must be 1-64 characters of [A-Za-z0-9_.-]")]
    InvalidRoom,
    #[error("unknown session")]
    UnknownSession,
    #[error("session closed: {0}")]
    SessionClosed(CloseReason),
    #[error("message stream already taken")]
    StreamTaken,
}

impl ChatError {
    /// Stable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Auth(e) => e.code(),
            ChatError::EmptyText => "EMPTY_TEXT",
            ChatError::TextTooLong { .. } => "TEXT_TOO_LONG",
            ChatError::NotJoined => "NOT_JOINED",
            ChatError::InvalidRoom => "INVALID_ROOM",
            ChatError::UnknownSession => "UNKNOWN_SESSION",
            ChatError::SessionClosed(_) => "SESSION_CLOSED",
            ChatError::StreamTaken => "STREAM_TAKEN",
        }
    }
}
