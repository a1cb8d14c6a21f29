//! Wire protocol for the Creditline broker.
//!
//! This crate provides:
//! - Frame types for both directions (client → broker, broker → client)
//! - Envelope and error code definitions
//! - Newline-delimited JSON line codec with partial-read reassembly
//!
//! Nothing in here performs I/O; the broker and client crates own the sockets.

mod codec;
mod envelope;
mod frame;

pub use codec::{encode_frame, split_frames, CodecError, CodecResult, LineDecoder, DEFAULT_MAX_FRAME_BYTES};
pub use envelope::{Envelope, EnvelopeDraft};
pub use frame::{ClientFrame, ErrorCode, Inbound, ServerFrame, DEFAULT_GRANT};

/// Protocol version announced in the `hello` reply.
pub const PROTOCOL_VERSION: u32 = 1;

/// Features the broker advertises during the handshake.
pub const FEATURES: &[&str] = &[
    "credit",
    "ack",
    "nack",
    "stats",
    "snapshot",
    "metrics",
    "blob-offload",
    "idempotency",
];
