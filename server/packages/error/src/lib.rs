//! Shared error taxonomy for the coderelay bridge.
//!
//! Variants are `Clone` so a single connect attempt can be shared by
//! concurrent callers (`futures::future::Shared` requires a clonable result).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// A hard prerequisite is missing (agent binary, client library) or the
    /// supervisor has marked the backend unavailable. Never retried
    /// automatically.
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },

    /// The supervisor's shutting-down flag is set; no new work is accepted.
    #[error("bridge is shutting down")]
    ShuttingDown,

    /// A connect attempt against the backend transport failed.
    #[error("backend connect failed: {message}")]
    ConnectFailed { message: String },

    /// The live connection or event stream broke mid-flight.
    #[error("stream error: {message}")]
    StreamError { message: String },

    /// The agent driver reported a turn-local failure.
    #[error("agent driver error: {message}")]
    Driver { message: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("timed out: {message}")]
    Timeout { message: String },
}

impl BridgeError {
    /// Errors that should fail fast instead of entering the retry path.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::ShuttingDown)
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::StreamError {
            message: message.into(),
        }
    }
}
