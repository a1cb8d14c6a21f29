//! Per-connection session handle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use wire_protocol_types::{Envelope, ServerFrame};

/// Subscription binding and credit balance.
#[derive(Debug, Default)]
pub(crate) struct Binding {
    pub(crate) stream: Option<String>,
    pub(crate) credit: u64,
}

/// Broker-side view of one connection.
///
/// Holds the credit balance, the bound stream and an index of envelopes
/// currently inflight to this session. Deliveries are pushed onto an
/// unbounded channel drained by the connection's writer task, so the
/// scheduler never waits on a socket.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    pub(crate) binding: Mutex<Binding>,
    /// Envelope ID -> origin streams, in delivery order. IDs are only
    /// unique within a stream, so one ID may be inflight from several.
    pub(crate) inflight: Mutex<HashMap<String, Vec<String>>>,
    granted: AtomicU64,
    delivered: AtomicU64,
}

impl SessionHandle {
    /// Create a session with a generated ID.
    pub fn new(outbound: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self::with_id(&uuid::Uuid::new_v4().to_string(), outbound)
    }

    /// Create a session with a fixed ID.
    pub fn with_id(id: &str, outbound: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            id: id.to_string(),
            outbound,
            binding: Mutex::new(Binding::default()),
            inflight: Mutex::new(HashMap::new()),
            granted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Get the session ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current credit balance.
    pub fn credit(&self) -> u64 {
        self.binding.lock().credit
    }

    /// Stream this session is subscribed to.
    pub fn subscription(&self) -> Option<String> {
        self.binding.lock().stream.clone()
    }

    /// Number of envelopes delivered to this session and not yet settled.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().values().map(Vec::len).sum()
    }

    /// Credit granted over the session lifetime.
    pub fn granted_total(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    /// Envelopes delivered over the session lifetime.
    pub fn delivered_total(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Record that `id` from `stream` is inflight to this session.
    pub(crate) fn index_inflight(&self, id: &str, stream: &str) {
        let mut index = self.inflight.lock();
        let origins = index.entry(id.to_string()).or_default();
        if !origins.iter().any(|s| s == stream) {
            origins.push(stream.to_string());
        }
    }

    /// Forget `id` from `stream`.
    pub(crate) fn unindex_inflight(&self, id: &str, stream: &str) {
        let mut index = self.inflight.lock();
        if let Some(origins) = index.get_mut(id) {
            origins.retain(|s| s != stream);
            if origins.is_empty() {
                index.remove(id);
            }
        }
    }

    /// Streams `id` may be inflight from, earliest delivery first.
    pub(crate) fn inflight_origins(&self, id: &str) -> Vec<String> {
        self.inflight.lock().get(id).cloned().unwrap_or_default()
    }

    /// Add credit and return the stream to schedule, if bound.
    pub(crate) fn add_credit(&self, n: u64) -> Option<String> {
        let mut binding = self.binding.lock();
        binding.credit = binding.credit.saturating_add(n);
        self.granted.fetch_add(n, Ordering::Relaxed);
        binding.stream.clone()
    }

    /// Consume one credit unit if the session is still bound to `stream`.
    pub(crate) fn try_take_credit(&self, stream: &str) -> bool {
        let mut binding = self.binding.lock();
        if binding.credit == 0 || binding.stream.as_deref() != Some(stream) {
            return false;
        }
        binding.credit -= 1;
        true
    }

    /// Return a credit unit taken for a delivery that could not be sent.
    pub(crate) fn refund_credit(&self) {
        let mut binding = self.binding.lock();
        binding.credit = binding.credit.saturating_add(1);
    }

    /// Push a `deliver` frame to the connection; `false` once the connection is gone.
    pub(crate) fn deliver(&self, env: Envelope) -> bool {
        let sent = self.outbound.send(ServerFrame::deliver(env)).is_ok();
        if sent {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }
}
