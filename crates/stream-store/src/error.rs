//! Stream store error types.

use thiserror::Error;

/// Stream store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Stream depth cap reached
    #[error("Stream {stream} is full ({depth} pending)")]
    StreamFull { stream: String, depth: usize },

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Envelope ID already pending or inflight on the stream
    #[error("Envelope {id} already queued on stream {stream}")]
    DuplicateEnvelope { stream: String, id: String },

    /// Internal bookkeeping no longer agrees with itself
    #[error("Store corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Whether the broker must stop rather than report the error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupted(_))
    }
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
