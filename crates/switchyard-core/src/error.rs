//! Error types for switchyard-core

use thiserror::Error;

/// Main error type for switchyard-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("agent already registered: {0}")]
    DuplicateName(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("concurrent update on session: {0}")]
    Conflict(String),

    #[error("session {0} is still owned by supervisor {1}")]
    StillOwned(String, String),

    #[error("no capable agent for tags: {0}")]
    NoCapableAgent(String),

    #[error("capacity exceeded: {0} turns in flight")]
    CapacityExceeded(u32),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("dispatch to agent {0} timed out")]
    DispatchTimeout(String),

    #[error("agent {0} failed: {1}")]
    DispatchFailed(String, String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl Error {
    /// Whether the supervisor should flag itself degraded after seeing this error.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

/// Result type alias for switchyard-core
pub type Result<T> = std::result::Result<T, Error>;
