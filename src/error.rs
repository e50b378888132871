//! Error types for the relay core.

use crate::models::SessionStatus;

/// Failures from the durable session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("no active session for thread {0}")]
    NoActiveSession(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    /// Another active session already owns the thread.
    #[error("thread {0} already has an active session")]
    ThreadActive(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store lock poisoned")]
    Poisoned,
}

/// Failures talking to the chat service.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The client has not been pointed at a channel yet.
    #[error("chat client is not bound to a channel")]
    Unbound,

    #[error("malformed chat response: {0}")]
    Malformed(String),
}

/// Failures writing or restoring approval response sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("response sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("response already written to {0}")]
    AlreadyWritten(String),

    #[error("unknown response sink handle {0}")]
    UnknownHandle(String),
}

/// Errors surfaced by the inbound handlers and the reconciliation loop.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {id} is {status}")]
    SessionInactive { id: String, status: SessionStatus },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => RelayError::SessionNotFound(id),
            other => RelayError::Store(other),
        }
    }
}

/// Startup configuration problems. Fatal before the loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
