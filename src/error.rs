//! Error types for tcpnet

use thiserror::Error;

use crate::common::ConnectionId;

/// Main error type for tcpnet
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Already started")]
    AlreadyStarted,

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Send queue full (capacity {capacity})")]
    SendQueueFull { capacity: usize },

    #[error("Unknown channel: {0}")]
    UnknownChannel(ConnectionId),

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Build an `InvalidState` error from any debuggable state value
    pub(crate) fn invalid_state(expected: &'static str, actual: impl std::fmt::Debug) -> Self {
        Error::InvalidState {
            expected,
            actual: format!("{:?}", actual),
        }
    }
}

/// Result type alias for tcpnet
pub type Result<T> = std::result::Result<T, Error>;
