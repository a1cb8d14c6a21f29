//! Stream store for the Creditline broker.
//!
//! This crate provides:
//! - StreamStore: registry of named streams, each behind its own lock
//! - Credit scheduler: matches session credit to pending envelopes
//! - SessionHandle: per-connection credit balance and inflight index
//! - Stats aggregation: per-stream and global observability snapshots

mod error;
mod policy;
mod scheduler;
mod session;
mod stats;
mod store;
mod stream;

pub use error::{StoreError, StoreResult};
pub use policy::{StorePolicy, DEFAULT_LATENCY_SAMPLES, DEFAULT_STATS_WINDOW};
pub use session::SessionHandle;
pub use stats::{MetricsReport, SnapshotRow, StreamMetrics, StreamStats, Totals};
pub use store::StreamStore;
