//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// Infrastructure failures are returned as `Err` from
/// [`SshExecutor::execute`](crate::SshExecutor::execute); command and transfer
/// failures travel inside [`SshResult::Failure`](crate::SshResult).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to borrow connection for {host}: {source}")]
    PoolAcquire {
        host: String,
        #[source]
        source: TransportError,
    },

    #[error("Timed out opening session after {timeout_ms}ms")]
    SessionOpenTimeout { timeout_ms: u64 },

    #[error("Failed to open session: {0}")]
    SessionOpenFailure(#[source] TransportError),

    #[error("Worker pool '{pool}' is at capacity")]
    CapacityExceeded { pool: &'static str },

    #[error("Worker pool '{pool}' is shut down")]
    PoolShutdown { pool: &'static str },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("{0}")]
    CommandExecution(String),

    #[error("Command failed: {0}")]
    CommandFailure(#[source] TransportError),

    #[error("Transfer failed: {0}")]
    Transfer(#[source] TransportError),

    #[error("Session for {host} used after its connection was released")]
    SessionReleased { host: String },

    #[error("Interrupted while waiting for {0}")]
    InterruptedDuringWait(&'static str),

    #[error("SSH error on {host}: {source}")]
    Execution {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote rejected request: {0}")]
    Rejected(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Error returned by a [`LineProcessor`](crate::LineProcessor) for a single line
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::num::ParseIntError> for ProcessingError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for ProcessingError {
    fn from(err: std::num::ParseFloatError) -> Self {
        Self(err.to_string())
    }
}
