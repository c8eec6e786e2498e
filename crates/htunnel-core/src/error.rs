use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already running: {0}")]
    SessionExists(String),

    #[error("stale sequence {got}, expected {expected}")]
    StaleSequence { got: u64, expected: u64 },

    #[error("sequence {got} outside the reorder window (expected {expected}, window {window})")]
    SequenceWindow { got: u64, expected: u64, window: u64 },

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
