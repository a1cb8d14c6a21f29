//! Credit scheduler.
//!
//! Runs under the stream lock. Matches credited consumers to the pending FIFO
//! and moves requeued envelopes back to the head.

use crate::stream::{InflightRecord, PendingEntry, StreamState, DEAD_LETTER_CAPACITY};
use crate::StorePolicy;
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::{debug, warn};

/// Deliver pending envelopes to credited consumers until credit or envelopes run out.
///
/// Consumers are served round-robin, one envelope per turn. Returns the
/// number of envelopes delivered.
pub(crate) fn schedule(state: &mut StreamState, now: Instant, wall: DateTime<Utc>) -> usize {
    let mut delivered = 0;

    loop {
        if state.consumers.is_empty() {
            break;
        }
        // Entries held back by redelivery backoff do not block the ones behind them.
        let Some(position) = state.pending.iter().position(|p| p.is_ready(now)) else {
            break;
        };
        let Some(index) = take_credit_round_robin(state) else {
            break;
        };
        let Some(entry) = state.pending.remove(position) else {
            break;
        };

        let session = state.consumers[index].session.clone();
        let env_id = entry.env.id.clone();

        session.index_inflight(&env_id, &state.name);

        if !session.deliver(entry.env.clone()) {
            // Connection already gone: undo and drop the consumer.
            session.unindex_inflight(&env_id, &state.name);
            session.refund_credit();
            state.pending.insert(position, entry);
            state.remove_consumer(session.id());
            debug!(stream = %state.name, session = %session.id(), "Dropped closed consumer");
            continue;
        }

        let delivery_seq = state.next_delivery_seq;
        state.next_delivery_seq += 1;
        state.inflight.insert(
            env_id,
            InflightRecord {
                env: entry.env,
                delivered_to: session.id().to_string(),
                delivered_at: now,
                enqueued_at: entry.enqueued_at,
                attempts: entry.attempts,
                delivery_seq,
            },
        );
        state.rate_out.record(now);
        state.last_ts = Some(wall);
        delivered += 1;
    }

    delivered
}

/// Take one credit from the next consumer in rotation that has any.
fn take_credit_round_robin(state: &mut StreamState) -> Option<usize> {
    let count = state.consumers.len();
    for offset in 0..count {
        let index = (state.next_consumer + offset) % count;
        if state.consumers[index].session.try_take_credit(&state.name) {
            state.next_consumer = (index + 1) % count;
            return Some(index);
        }
    }
    None
}

/// Put settled-without-ack records back at the head of the FIFO.
///
/// The earliest-delivered record ends up first. Records past the redelivery
/// ceiling are dead-lettered instead; returns how many.
pub(crate) fn requeue_front(
    state: &mut StreamState,
    mut records: Vec<InflightRecord>,
    policy: &StorePolicy,
    now: Instant,
) -> usize {
    let mut dead = 0;
    records.sort_by_key(|r| std::cmp::Reverse(r.delivery_seq));

    for record in records {
        let attempts = record.attempts.saturating_add(1);

        if policy.exceeds_redeliveries(attempts) {
            warn!(
                stream = %state.name,
                envelope = %record.env.id,
                attempts = record.attempts,
                "Redelivery limit reached, dead-lettering envelope"
            );
            state.known_ids.remove(&record.env.id);
            state.dead_lettered += 1;
            if state.dead_letters.len() == DEAD_LETTER_CAPACITY {
                if let Some(dropped) = state.dead_letters.pop_front() {
                    warn!(stream = %state.name, envelope = %dropped.id, "Dead-letter buffer full, dropping oldest");
                }
            }
            state.dead_letters.push_back(record.env);
            dead += 1;
            continue;
        }

        state.pending.push_front(PendingEntry {
            env: record.env,
            enqueued_at: record.enqueued_at,
            attempts,
            not_before: policy.backoff_for(attempts).map(|delay| now + delay),
        });
    }

    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionHandle;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wire_protocol_types::{EnvelopeDraft, ServerFrame};

    fn entry(id: &str, now: Instant) -> PendingEntry {
        PendingEntry {
            env: EnvelopeDraft::new(serde_json::json!(id))
                .with_id(id)
                .seal(String::new, Utc::now()),
            enqueued_at: now,
            attempts: 0,
            not_before: None,
        }
    }

    fn consumer(
        state: &mut StreamState,
        id: &str,
        credit: u64,
    ) -> (Arc<SessionHandle>, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(SessionHandle::with_id(id, tx));
        session.binding.lock().stream = Some(state.name.clone());
        session.add_credit(credit);
        state.add_consumer(session.clone());
        (session, rx)
    }

    fn delivered_ids(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::Deliver { env } = frame {
                ids.push(env.id);
            }
        }
        ids
    }

    #[test]
    fn test_schedule_respects_credit() {
        let now = Instant::now();
        let mut state = StreamState::new("orders", &StorePolicy::default());
        for id in ["a", "b", "c"] {
            state.pending.push_back(entry(id, now));
        }
        let (session, mut rx) = consumer(&mut state, "s1", 2);

        assert_eq!(schedule(&mut state, now, Utc::now()), 2);
        assert_eq!(delivered_ids(&mut rx), vec!["a", "b"]);
        assert_eq!(session.credit(), 0);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.inflight.len(), 2);
        assert_eq!(session.inflight_count(), 2);
    }

    #[test]
    fn test_schedule_round_robin() {
        let now = Instant::now();
        let mut state = StreamState::new("orders", &StorePolicy::default());
        for id in ["a", "b", "c", "d"] {
            state.pending.push_back(entry(id, now));
        }
        let (_s1, mut rx1) = consumer(&mut state, "s1", 5);
        let (_s2, mut rx2) = consumer(&mut state, "s2", 5);

        schedule(&mut state, now, Utc::now());
        assert_eq!(delivered_ids(&mut rx1), vec!["a", "c"]);
        assert_eq!(delivered_ids(&mut rx2), vec!["b", "d"]);
    }

    #[test]
    fn test_schedule_skips_backed_off_entries() {
        let now = Instant::now();
        let mut state = StreamState::new("orders", &StorePolicy::default());
        let mut held = entry("held", now);
        held.not_before = Some(now + Duration::from_secs(5));
        state.pending.push_back(held);
        state.pending.push_back(entry("next", now));
        let (_session, mut rx) = consumer(&mut state, "s1", 2);

        schedule(&mut state, now, Utc::now());
        assert_eq!(delivered_ids(&mut rx), vec!["next"]);

        schedule(&mut state, now + Duration::from_secs(5), Utc::now());
        assert_eq!(delivered_ids(&mut rx), vec!["held"]);
    }

    #[test]
    fn test_schedule_drops_closed_consumer() {
        let now = Instant::now();
        let mut state = StreamState::new("orders", &StorePolicy::default());
        state.pending.push_back(entry("a", now));
        let (closed, rx) = consumer(&mut state, "gone", 1);
        drop(rx);
        let (_live, mut live_rx) = consumer(&mut state, "live", 1);

        assert_eq!(schedule(&mut state, now, Utc::now()), 1);
        assert_eq!(delivered_ids(&mut live_rx), vec!["a"]);
        assert_eq!(state.consumers.len(), 1);
        assert_eq!(closed.inflight_count(), 0);
    }

    #[test]
    fn test_requeue_front_keeps_delivery_order() {
        let now = Instant::now();
        let mut state = StreamState::new("orders", &StorePolicy::default());
        for id in ["a", "b", "c"] {
            state.pending.push_back(entry(id, now));
        }
        let (_session, _rx) = consumer(&mut state, "s1", 2);
        schedule(&mut state, now, Utc::now());

        let records: Vec<InflightRecord> = state.inflight.drain().map(|(_, r)| r).collect();
        assert_eq!(requeue_front(&mut state, records, &StorePolicy::default(), now), 0);

        let order: Vec<&str> = state.pending.iter().map(|p| p.env.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(state.pending[0].attempts, 1);
    }

    #[test]
    fn test_requeue_dead_letters_past_limit() {
        let now = Instant::now();
        let policy = StorePolicy {
            max_redeliveries: Some(1),
            ..Default::default()
        };
        let mut state = StreamState::new("orders", &policy);
        let mut first = entry("a", now);
        first.attempts = 1;
        state.known_ids.insert("a".to_string());
        state.pending.push_back(first);
        let (_session, _rx) = consumer(&mut state, "s1", 1);
        schedule(&mut state, now, Utc::now());

        let records: Vec<InflightRecord> = state.inflight.drain().map(|(_, r)| r).collect();
        assert_eq!(requeue_front(&mut state, records, &policy, now), 1);
        assert!(state.pending.is_empty());
        assert_eq!(state.dead_lettered, 1);
        assert!(!state.known_ids.contains("a"));
        let held: Vec<&str> = state.dead_letters.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(held, vec!["a"]);
    }
}
