//! IPC error types.

use thiserror::Error;
use wire_protocol_types::{CodecError, ErrorCode};

/// IPC error type.
#[derive(Error, Debug)]
pub enum IpcError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Broker answered with an `error` frame
    #[error("Broker error {code}: {detail}")]
    Broker {
        code: ErrorCode,
        detail: serde_json::Value,
    },

    /// Unexpected frame from the peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket error
    #[error("Socket error: {0}")]
    Socket(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Broker state is no longer trustworthy
    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

impl IpcError {
    /// Wire error code, if the broker rejected a request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            IpcError::Broker { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias using IpcError.
pub type IpcResult<T> = Result<T, IpcError>;
