use std::path::PathBuf;

/// Connect, publish or subscribe failure. Never fatal on its own: it either
/// drives the reconnect state machine or is logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("connection to {0} timed out")]
    Timeout(String),
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// Malformed inbound payload. The message is dropped, counters stay untouched.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected topic: {0}")]
    UnknownTopic(String),
    #[error("presence topic {topic} does not match payload agent {agent_id}")]
    IdentityMismatch { topic: String, agent_id: String },
}

/// I/O failure on snapshot load/save. Memory stays authoritative.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
