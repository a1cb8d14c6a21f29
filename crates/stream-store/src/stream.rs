//! State of a single stream.

use crate::stats::{LatencySampler, RateWindow, SnapshotRow, StreamStats};
use crate::{SessionHandle, StorePolicy};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use wire_protocol_types::Envelope;

/// Dead-lettered envelopes held per stream until drained.
pub(crate) const DEAD_LETTER_CAPACITY: usize = 1024;

/// Envelope waiting in the pending FIFO.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub(crate) env: Envelope,
    pub(crate) enqueued_at: Instant,
    /// Times this envelope has been requeued.
    pub(crate) attempts: u32,
    /// Not eligible for delivery before this instant (redelivery backoff).
    pub(crate) not_before: Option<Instant>,
}

impl PendingEntry {
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// Envelope delivered to a session and not yet settled.
#[derive(Debug, Clone)]
pub(crate) struct InflightRecord {
    pub(crate) env: Envelope,
    pub(crate) delivered_to: String,
    pub(crate) delivered_at: Instant,
    pub(crate) enqueued_at: Instant,
    pub(crate) attempts: u32,
    /// Per-stream delivery sequence, used to keep requeue order stable.
    pub(crate) delivery_seq: u64,
}

/// Subscribed session.
#[derive(Debug, Clone)]
pub(crate) struct Consumer {
    pub(crate) session: Arc<SessionHandle>,
}

/// Pending FIFO, inflight set and rolling counters for one stream.
///
/// Always accessed under the stream's own lock; see `StreamStore`.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) name: String,
    pub(crate) pending: VecDeque<PendingEntry>,
    pub(crate) inflight: HashMap<String, InflightRecord>,
    /// IDs currently pending or inflight.
    pub(crate) known_ids: HashSet<String>,
    pub(crate) consumers: Vec<Consumer>,
    /// Round-robin cursor into `consumers`.
    pub(crate) next_consumer: usize,
    pub(crate) next_delivery_seq: u64,
    pub(crate) rate_in: RateWindow,
    pub(crate) rate_out: RateWindow,
    pub(crate) latency: LatencySampler,
    pub(crate) last_ts: Option<DateTime<Utc>>,
    pub(crate) dead_lettered: u64,
    /// Dead-lettered envelopes not yet handed off, oldest first.
    pub(crate) dead_letters: VecDeque<Envelope>,
}

impl StreamState {
    pub(crate) fn new(name: &str, policy: &StorePolicy) -> Self {
        Self {
            name: name.to_string(),
            pending: VecDeque::new(),
            inflight: HashMap::new(),
            known_ids: HashSet::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            next_delivery_seq: 0,
            rate_in: RateWindow::new(policy.stats_window),
            rate_out: RateWindow::new(policy.stats_window),
            latency: LatencySampler::new(policy.latency_samples),
            last_ts: None,
            dead_lettered: 0,
            dead_letters: VecDeque::new(),
        }
    }

    /// Register a consumer; a session is listed at most once.
    pub(crate) fn add_consumer(&mut self, session: Arc<SessionHandle>) {
        if !self.consumers.iter().any(|c| c.session.id() == session.id()) {
            self.consumers.push(Consumer { session });
        }
    }

    pub(crate) fn remove_consumer(&mut self, session_id: &str) {
        self.consumers.retain(|c| c.session.id() != session_id);
        if self.next_consumer >= self.consumers.len() {
            self.next_consumer = 0;
        }
    }

    /// Inflight records owned by `session_id`, earliest delivery first.
    pub(crate) fn inflight_owned_by(&self, session_id: &str) -> Vec<String> {
        let mut owned: Vec<(&u64, &String)> = self
            .inflight
            .iter()
            .filter(|(_, record)| record.delivered_to == session_id)
            .map(|(id, record)| (&record.delivery_seq, id))
            .collect();
        owned.sort();
        owned.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub(crate) fn stats(&mut self, now: Instant) -> StreamStats {
        StreamStats {
            depth: self.pending.len(),
            inflight: self.inflight.len(),
            rate_in: self.rate_in.count(now),
            rate_out: self.rate_out.count(now),
            lat_p50: self.latency.percentile_ms(50.0),
            lat_p95: self.latency.percentile_ms(95.0),
            last_ts: self.last_ts,
            dead_lettered: self.dead_lettered,
            consumers: self.consumers.len(),
        }
    }

    pub(crate) fn snapshot(&self) -> SnapshotRow {
        let mut inflight: Vec<&InflightRecord> = self.inflight.values().collect();
        inflight.sort_by_key(|r| r.delivery_seq);

        SnapshotRow {
            stream: self.name.clone(),
            depth: self.pending.len(),
            inflight: self.inflight.len(),
            pending: self.pending.iter().map(|p| p.env.clone()).collect(),
            inflight_ids: inflight.into_iter().map(|r| r.env.id.clone()).collect(),
        }
    }
}
