//! Connection layer for the Creditline broker.
//!
//! This crate provides:
//! - Connection sessions: handshake gate and frame dispatch per connection
//! - Broker: shared state behind every connection (store, blobs, idempotency)
//! - BrokerServer: Unix socket (and optional TCP) accept loop plus sweeper
//! - BrokerClient: typed client over the same wire protocol

mod broker;
mod client;
mod error;
mod server;
mod session;

pub use broker::{Broker, BrokerOptions};
pub use client::BrokerClient;
pub use error::{IpcError, IpcResult};
pub use server::BrokerServer;
pub use session::serve_connection;
