//! Stream registry and the broker's core operations.

use crate::scheduler::{requeue_front, schedule};
use crate::stats::{MetricsReport, SnapshotRow, StreamMetrics, StreamStats};
use crate::stream::{InflightRecord, PendingEntry, StreamState};
use crate::{SessionHandle, StoreError, StorePolicy, StoreResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use wire_protocol_types::{Envelope, EnvelopeDraft};

type StreamRef = Arc<Mutex<StreamState>>;

/// Registry of named streams.
///
/// Each stream sits behind its own mutex, so operations on different streams
/// run in parallel while every transition on one stream is serialized. When
/// both are needed, the stream lock is taken before any session lock.
///
/// Streams are created on first `enqueue` or `subscribe` and live for the
/// lifetime of the store.
pub struct StreamStore {
    policy: StorePolicy,
    streams: RwLock<HashMap<String, StreamRef>>,
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new(StorePolicy::default())
    }
}

impl StreamStore {
    /// Create an empty store.
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            policy,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Policy the store was created with.
    pub fn policy(&self) -> &StorePolicy {
        &self.policy
    }

    fn stream(&self, name: &str) -> Option<StreamRef> {
        self.streams.read().get(name).cloned()
    }

    fn get_or_create_stream(&self, name: &str) -> StreamRef {
        if let Some(stream) = self.stream(name) {
            return stream;
        }

        let mut streams = self.streams.write();
        streams
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(stream = %name, "Created stream");
                Arc::new(Mutex::new(StreamState::new(name, &self.policy)))
            })
            .clone()
    }

    fn all_streams(&self) -> Vec<StreamRef> {
        let streams = self.streams.read();
        let mut names: Vec<&String> = streams.keys().collect();
        names.sort();
        names.into_iter().filter_map(|n| streams.get(n).cloned()).collect()
    }

    /// Names of every known stream, sorted.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Append an envelope to the tail of `stream` and run the scheduler.
    ///
    /// A missing envelope ID is generated and a missing timestamp defaults to
    /// the enqueue time. Returns the envelope as stored.
    pub fn enqueue(&self, stream: &str, draft: EnvelopeDraft, now: Instant) -> StoreResult<Envelope> {
        let handle = self.get_or_create_stream(stream);
        let mut state = handle.lock();

        if let Some(max) = self.policy.max_stream_depth {
            if state.pending.len() >= max {
                return Err(StoreError::StreamFull {
                    stream: stream.to_string(),
                    depth: state.pending.len(),
                });
            }
        }

        let wall = Utc::now();
        let env = draft.seal(|| uuid::Uuid::new_v4().to_string(), wall);
        if state.known_ids.contains(&env.id) {
            return Err(StoreError::DuplicateEnvelope {
                stream: stream.to_string(),
                id: env.id,
            });
        }

        state.known_ids.insert(env.id.clone());
        state.pending.push_back(PendingEntry {
            env: env.clone(),
            enqueued_at: now,
            attempts: 0,
            not_before: None,
        });
        state.rate_in.record(now);
        state.last_ts = Some(wall);

        debug!(stream = %stream, envelope = %env.id, depth = state.pending.len(), "Enqueued");
        schedule(&mut state, now, wall);
        Ok(env)
    }

    /// Bind `session` to `stream`, replacing any earlier subscription.
    ///
    /// Re-subscribing forfeits the current credit balance. Envelopes already
    /// inflight stay attributed to the stream they came from.
    pub fn subscribe(&self, session: &Arc<SessionHandle>, stream: &str, now: Instant) {
        let previous = {
            let mut binding = session.binding.lock();
            let previous = binding.stream.replace(stream.to_string());
            if previous.is_some() {
                binding.credit = 0;
            }
            previous
        };

        if let Some(old) = previous.as_deref().filter(|old| *old != stream) {
            if let Some(handle) = self.stream(old) {
                handle.lock().remove_consumer(session.id());
            }
        }

        let handle = self.get_or_create_stream(stream);
        let mut state = handle.lock();
        state.add_consumer(session.clone());
        schedule(&mut state, now, Utc::now());

        debug!(session = %session.id(), stream = %stream, "Subscribed");
    }

    /// Add credit to `session` and deliver from its stream.
    ///
    /// Credit granted before any subscription accumulates on the session.
    /// Returns the number of envelopes delivered.
    pub fn grant(&self, session: &Arc<SessionHandle>, n: u64, now: Instant) -> usize {
        let Some(stream) = session.add_credit(n) else {
            return 0;
        };
        let Some(handle) = self.stream(&stream) else {
            return 0;
        };
        let mut state = handle.lock();
        schedule(&mut state, now, Utc::now())
    }

    /// Take the earliest-delivered inflight record for `id` that `session` owns.
    ///
    /// Stale index entries (the record timed out or moved to another session)
    /// are dropped on the way.
    fn settle<F, T>(&self, session: &SessionHandle, id: &str, on_record: F) -> StoreResult<Option<T>>
    where
        F: FnOnce(&mut StreamState, InflightRecord) -> T,
    {
        for stream in session.inflight_origins(id) {
            let Some(handle) = self.stream(&stream) else {
                return Err(StoreError::Corrupted(format!(
                    "session {} holds envelope {} from unknown stream {}",
                    session.id(),
                    id,
                    stream
                )));
            };

            let mut state = handle.lock();
            session.unindex_inflight(id, &stream);
            let owned = state
                .inflight
                .get(id)
                .is_some_and(|record| record.delivered_to == session.id());
            if !owned {
                continue;
            }
            if let Some(record) = state.inflight.remove(id) {
                return Ok(Some(on_record(&mut *state, record)));
            }
        }

        Ok(None)
    }

    /// Acknowledge envelope `id`, removing it permanently.
    ///
    /// Acking an unknown or already-settled ID is a no-op returning `false`.
    pub fn ack(&self, session: &SessionHandle, id: &str) -> StoreResult<bool> {
        let settled = self.settle(session, id, |state, record| {
            state.known_ids.remove(&record.env.id);
            state
                .latency
                .record(record.delivered_at.saturating_duration_since(record.enqueued_at));
            debug!(stream = %state.name, envelope = %id, "Acked");
        })?;
        Ok(settled.is_some())
    }

    /// Reject envelope `id`, requeueing it at the head of its stream.
    ///
    /// Nacking an unknown or already-settled ID is a no-op returning `false`.
    pub fn nack(&self, session: &SessionHandle, id: &str, now: Instant) -> StoreResult<bool> {
        let settled = self.settle(session, id, |state, record| {
            debug!(stream = %state.name, envelope = %id, "Nacked");
            requeue_front(state, vec![record], &self.policy, now);
            schedule(state, now, Utc::now());
        })?;
        Ok(settled.is_some())
    }

    /// Release everything held by a closing session.
    ///
    /// Unbinds the session and requeues its inflight envelopes at the head of
    /// their streams before returning, so no later delivery can observe them
    /// as still inflight. Returns the number of envelopes released.
    pub fn close_session(&self, session: &SessionHandle, now: Instant) -> StoreResult<usize> {
        let subscribed = {
            let mut binding = session.binding.lock();
            binding.credit = 0;
            binding.stream.take()
        };
        if let Some(handle) = subscribed.as_deref().and_then(|s| self.stream(s)) {
            handle.lock().remove_consumer(session.id());
        }

        let index = std::mem::take(&mut *session.inflight.lock());
        let origins: BTreeSet<String> = index.into_values().flatten().collect();

        let mut released = 0;
        for origin in origins {
            let Some(handle) = self.stream(&origin) else {
                return Err(StoreError::Corrupted(format!(
                    "session {} holds envelopes from unknown stream {}",
                    session.id(),
                    origin
                )));
            };

            let mut state = handle.lock();
            let owned = state.inflight_owned_by(session.id());
            let records: Vec<InflightRecord> = owned
                .iter()
                .filter_map(|id| state.inflight.remove(id))
                .collect();
            released += records.len();
            requeue_front(&mut state, records, &self.policy, now);
            schedule(&mut state, now, Utc::now());
        }

        if released > 0 {
            info!(session = %session.id(), released, "Requeued inflight envelopes of closed session");
        }
        Ok(released)
    }

    /// Periodic maintenance.
    ///
    /// Requeues inflight envelopes past the ack timeout, delivers entries
    /// whose backoff has elapsed and checks each stream's bookkeeping.
    /// Returns the number of envelopes that timed out.
    pub fn tick(&self, now: Instant) -> StoreResult<usize> {
        let mut expired_total = 0;

        for handle in self.all_streams() {
            let mut state = handle.lock();

            if let Some(timeout) = self.policy.ack_timeout {
                let expired: Vec<String> = state
                    .inflight
                    .iter()
                    .filter(|(_, r)| now.saturating_duration_since(r.delivered_at) >= timeout)
                    .map(|(id, _)| id.clone())
                    .collect();
                if !expired.is_empty() {
                    let records: Vec<InflightRecord> = expired
                        .iter()
                        .filter_map(|id| state.inflight.remove(id))
                        .collect();
                    warn!(stream = %state.name, count = records.len(), "Ack timeout, requeueing");
                    expired_total += records.len();
                    requeue_front(&mut state, records, &self.policy, now);
                }
            }

            schedule(&mut state, now, Utc::now());

            let tracked = state.pending.len() + state.inflight.len();
            if state.known_ids.len() != tracked {
                return Err(StoreError::Corrupted(format!(
                    "stream {} tracks {} ids but holds {} envelopes",
                    state.name,
                    state.known_ids.len(),
                    tracked
                )));
            }
        }

        Ok(expired_total)
    }

    /// Take every dead-lettered envelope not yet handed off, tagged with its stream.
    pub fn drain_dead_letters(&self) -> Vec<(String, Envelope)> {
        let mut drained = Vec::new();
        for handle in self.all_streams() {
            let mut state = handle.lock();
            let name = state.name.clone();
            drained.extend(state.dead_letters.drain(..).map(|env| (name.clone(), env)));
        }
        drained
    }

    /// Stats for one stream.
    pub fn stats(&self, stream: &str, now: Instant) -> StoreResult<StreamStats> {
        let handle = self
            .stream(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.to_string()))?;
        let mut state = handle.lock();
        Ok(state.stats(now))
    }

    /// Stats for every stream plus totals.
    pub fn metrics(&self, now: Instant) -> MetricsReport {
        let streams = self
            .all_streams()
            .into_iter()
            .map(|handle| {
                let mut state = handle.lock();
                StreamMetrics {
                    id: state.name.clone(),
                    stats: state.stats(now),
                }
            })
            .collect();
        MetricsReport::from_streams(streams)
    }

    /// Point-in-time dump of every stream, sorted by name.
    pub fn snapshot(&self) -> Vec<SnapshotRow> {
        self.all_streams()
            .into_iter()
            .map(|handle| handle.lock().snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wire_protocol_types::ServerFrame;

    fn session(id: &str) -> (Arc<SessionHandle>, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SessionHandle::with_id(id, tx)), rx)
    }

    fn draft(id: &str) -> EnvelopeDraft {
        EnvelopeDraft::new(serde_json::json!({"id": id})).with_id(id)
    }

    fn next_id(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Option<String> {
        match rx.try_recv().ok()? {
            ServerFrame::Deliver { env } => Some(env.id),
            _ => None,
        }
    }

    #[test]
    fn test_enqueue_assigns_missing_id() {
        let store = StreamStore::default();
        let now = Instant::now();
        let env = store
            .enqueue("orders", EnvelopeDraft::new(serde_json::json!(1)), now)
            .unwrap();
        assert!(!env.id.is_empty());
        assert_eq!(store.stats("orders", now).unwrap().depth, 1);
    }

    #[test]
    fn test_enqueue_rejects_duplicate_id() {
        let store = StreamStore::default();
        let now = Instant::now();
        store.enqueue("orders", draft("a"), now).unwrap();
        let result = store.enqueue("orders", draft("a"), now);
        assert!(matches!(result, Err(StoreError::DuplicateEnvelope { .. })));
        // Same ID on another stream is fine.
        store.enqueue("billing", draft("a"), now).unwrap();
    }

    #[test]
    fn test_depth_cap() {
        let store = StreamStore::new(StorePolicy {
            max_stream_depth: Some(2),
            ..Default::default()
        });
        let now = Instant::now();
        store.enqueue("orders", draft("a"), now).unwrap();
        store.enqueue("orders", draft("b"), now).unwrap();

        let result = store.enqueue("orders", draft("c"), now);
        assert!(matches!(result, Err(StoreError::StreamFull { depth: 2, .. })));
        assert_eq!(store.stats("orders", now).unwrap().depth, 2);
    }

    #[test]
    fn test_grant_before_subscribe_carries_over() {
        let store = StreamStore::default();
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        store.enqueue("orders", draft("a"), now).unwrap();

        assert_eq!(store.grant(&s1, 1, now), 0);
        store.subscribe(&s1, "orders", now);
        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));
        assert_eq!(s1.credit(), 0);
    }

    #[test]
    fn test_resubscribe_forfeits_credit() {
        let store = StreamStore::default();
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        store.subscribe(&s1, "orders", now);
        store.grant(&s1, 3, now);

        store.subscribe(&s1, "billing", now);
        assert_eq!(s1.credit(), 0);
        store.enqueue("orders", draft("a"), now).unwrap();
        store.enqueue("billing", draft("b"), now).unwrap();
        assert!(next_id(&mut rx).is_none());
        assert_eq!(store.stats("orders", now).unwrap().consumers, 0);
        assert_eq!(store.stats("billing", now).unwrap().consumers, 1);
    }

    #[test]
    fn test_ack_is_idempotent_and_owner_only() {
        let store = StreamStore::default();
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        let (s2, _rx2) = session("s2");
        store.enqueue("orders", draft("a"), now).unwrap();
        store.subscribe(&s1, "orders", now);
        store.grant(&s1, 1, now);
        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));

        assert!(!store.ack(&s2, "a").unwrap());
        assert!(store.ack(&s1, "a").unwrap());
        assert!(!store.ack(&s1, "a").unwrap());
        assert!(!store.ack(&s1, "never-seen").unwrap());

        let stats = store.stats("orders", now).unwrap();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.inflight, 0);
        assert!(stats.lat_p50.is_some());
    }

    #[test]
    fn test_ack_timeout_requeues() {
        let store = StreamStore::new(StorePolicy {
            ack_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        store.enqueue("orders", draft("a"), now).unwrap();
        store.subscribe(&s1, "orders", now);
        store.grant(&s1, 1, now);
        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));

        assert_eq!(store.tick(now + Duration::from_secs(10)).unwrap(), 0);
        assert_eq!(store.tick(now + Duration::from_secs(30)).unwrap(), 1);
        let stats = store.stats("orders", now).unwrap();
        assert_eq!((stats.depth, stats.inflight), (1, 0));

        // The late ack no longer matches anything.
        assert!(!store.ack(&s1, "a").unwrap());
        assert_eq!(s1.inflight_count(), 0);
    }

    #[test]
    fn test_same_id_inflight_from_two_streams_requeues_both() {
        let store = StreamStore::default();
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        store.enqueue("a", draft("x"), now).unwrap();
        store.enqueue("b", draft("x"), now).unwrap();

        store.subscribe(&s1, "a", now);
        store.grant(&s1, 1, now);
        store.subscribe(&s1, "b", now);
        store.grant(&s1, 1, now);
        assert_eq!(next_id(&mut rx).as_deref(), Some("x"));
        assert_eq!(next_id(&mut rx).as_deref(), Some("x"));
        assert_eq!(s1.inflight_count(), 2);

        assert_eq!(store.close_session(&s1, now).unwrap(), 2);
        for stream in ["a", "b"] {
            let stats = store.stats(stream, now).unwrap();
            assert_eq!((stats.depth, stats.inflight), (1, 0), "stream {}", stream);
        }
    }

    #[test]
    fn test_same_id_inflight_from_two_streams_acks_both() {
        let store = StreamStore::default();
        let now = Instant::now();
        let (s1, _rx) = session("s1");
        store.enqueue("a", draft("x"), now).unwrap();
        store.enqueue("b", draft("x"), now).unwrap();

        store.subscribe(&s1, "a", now);
        store.grant(&s1, 1, now);
        store.subscribe(&s1, "b", now);
        store.grant(&s1, 1, now);

        assert!(store.ack(&s1, "x").unwrap());
        assert_eq!(store.stats("a", now).unwrap().inflight, 0);
        assert_eq!(store.stats("b", now).unwrap().inflight, 1);
        assert!(store.ack(&s1, "x").unwrap());
        assert!(!store.ack(&s1, "x").unwrap());
        assert_eq!(store.stats("b", now).unwrap().inflight, 0);
        assert_eq!(s1.inflight_count(), 0);
    }

    #[test]
    fn test_ack_leaves_last_ts_alone() {
        let store = StreamStore::default();
        let now = Instant::now();
        let (s1, _rx) = session("s1");
        store.enqueue("orders", draft("a"), now).unwrap();
        store.subscribe(&s1, "orders", now);
        store.grant(&s1, 1, now);
        let before = store.stats("orders", now).unwrap().last_ts;
        assert!(before.is_some());

        std::thread::sleep(Duration::from_millis(5));
        assert!(store.ack(&s1, "a").unwrap());
        assert_eq!(store.stats("orders", now).unwrap().last_ts, before);
    }

    #[test]
    fn test_backoff_delays_redelivery_until_tick() {
        let store = StreamStore::new(StorePolicy {
            redelivery_backoff: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        store.enqueue("orders", draft("a"), now).unwrap();
        store.subscribe(&s1, "orders", now);
        store.grant(&s1, 2, now);
        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));

        assert!(store.nack(&s1, "a", now).unwrap());
        assert!(next_id(&mut rx).is_none());

        store.tick(now + Duration::from_secs(1)).unwrap();
        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));
    }

    #[test]
    fn test_dead_letter_after_max_redeliveries() {
        let store = StreamStore::new(StorePolicy {
            max_redeliveries: Some(1),
            ..Default::default()
        });
        let now = Instant::now();
        let (s1, mut rx) = session("s1");
        store.enqueue("orders", draft("a"), now).unwrap();
        store.subscribe(&s1, "orders", now);
        store.grant(&s1, 5, now);

        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));
        store.nack(&s1, "a", now).unwrap();
        assert_eq!(next_id(&mut rx).as_deref(), Some("a"));
        store.nack(&s1, "a", now).unwrap();
        assert!(next_id(&mut rx).is_none());

        let stats = store.stats("orders", now).unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!((stats.depth, stats.inflight), (0, 0));
        assert_eq!(store.tick(now).unwrap(), 0);

        let drained = store.drain_dead_letters();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "orders");
        assert_eq!(drained[0].1.id, "a");
        assert!(store.drain_dead_letters().is_empty());
    }

    #[test]
    fn test_stats_unknown_stream() {
        let store = StreamStore::default();
        let result = store.stats("missing", Instant::now());
        assert!(matches!(result, Err(StoreError::StreamNotFound(_))));
    }

    #[test]
    fn test_metrics_and_snapshot_sorted() {
        let store = StreamStore::default();
        let now = Instant::now();
        store.enqueue("zeta", draft("z"), now).unwrap();
        store.enqueue("alpha", draft("a1"), now).unwrap();
        store.enqueue("alpha", draft("a2"), now).unwrap();

        let report = store.metrics(now);
        let ids: Vec<&str> = report.streams.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(report.totals.streams, 2);
        assert_eq!(report.totals.depth, 3);
        assert_eq!(report.totals.rate_in, 3);

        let rows = store.snapshot();
        assert_eq!(rows[0].stream, "alpha");
        let pending: Vec<&str> = rows[0].pending.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(pending, vec!["a1", "a2"]);
        assert_eq!(store.stream_names(), vec!["alpha", "zeta"]);
    }
}
