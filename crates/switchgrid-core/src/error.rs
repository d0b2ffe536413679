//! Switchgrid error types.
//! Every error carries an HTTP-status-like class so the gateway and the
//! Remote processor can surface it without re-classifying.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

/// Unified error type for all switchgrid crates.
#[derive(Debug, Error)]
pub enum GridError {
    /// Malformed input: bad pin address, undecodable record, invalid request.
    #[error("{0}")]
    BadRequest(String),

    /// Unknown controller, client, or key.
    #[error("{0}")]
    NotFound(String),

    /// Satellite did not answer within the bounded retry budget.
    #[error("{0}")]
    Unreachable(String),

    /// KV store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Socket-level failure talking to a satellite.
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer instance HTTP failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// Configuration load/parse failure.
    #[error("config error: {0}")]
    Config(String),

    /// Scheduler failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl GridError {
    /// HTTP-status-like class for this error.
    pub fn status(&self) -> u16 {
        match self {
            GridError::BadRequest(_) | GridError::Config(_) => 400,
            GridError::NotFound(_) => 404,
            GridError::Unreachable(_) => 503,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for GridError {
    fn from(e: std::io::Error) -> Self {
        GridError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::BadRequest(e.to_string())
    }
}
