//! Collaborators the Creditline broker talks to outside its in-memory core.
//!
//! This crate provides:
//! - **Blob store**: keeps large envelope payloads off the control-plane wire
//! - **Job queue**: backend-tagged job references with a status lifecycle
//! - **Idempotency cache**: replays recorded outcomes for retried requests

mod blob;
mod idempotency;
mod jobs;

pub use blob::{BlobRef, BlobStore, FsBlobStore, MemoryBlobStore, BLOB_MARKER};
pub use idempotency::{CachedResponse, IdempotencyCache, DEFAULT_IDEMPOTENCY_TTL};
pub use jobs::{JobQueue, JobRef, JobState, MemoryJobQueue};

use thiserror::Error;

/// Error type for backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Backend cannot serve requests right now
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Blob or job not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored content does not match its recorded digest
    #[error("Integrity check failed for {0}")]
    Integrity(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether the failure is the backend's rather than the caller's.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::Io(_) | BackendError::Integrity(_)
        )
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
