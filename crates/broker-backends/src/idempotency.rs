//! Idempotency cache for retried enqueue requests.
//!
//! Remembers the response sent for each idempotency key for a TTL so a
//! retried request replays it instead of enqueueing a duplicate.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a recorded outcome is replayed.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);

/// Outcome recorded for an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Protocol status (`ok` or an error code).
    pub status: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: &str, body: serde_json::Value) -> Self {
        Self {
            status: status.to_string(),
            body,
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct Entry {
    expires_at: Instant,
    response: CachedResponse,
}

/// Idempotency cache shared by every connection.
#[derive(Debug)]
pub struct IdempotencyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_IDEMPOTENCY_TTL)
    }
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Recorded outcome for `key`, if still live.
    pub fn lookup(&self, key: &str, now: Instant) -> Option<CachedResponse> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Record the outcome for `key`, replacing any earlier one.
    pub fn record(&self, key: &str, response: CachedResponse, now: Instant) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                expires_at: now + self.ttl,
                response,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_response_is_replayed() {
        let now = Instant::now();
        let cache = IdempotencyCache::new(Duration::from_secs(5));
        assert!(cache.lookup("k1", now).is_none());

        let response = CachedResponse::new("ok", serde_json::json!({"id": "e1"}))
            .with_header("stream", "orders");
        cache.record("k1", response.clone(), now);

        let found = cache.lookup("k1", now + Duration::from_secs(1)).unwrap();
        assert_eq!(found, response);
        assert_eq!(found.headers.get("stream").map(String::as_str), Some("orders"));
    }

    #[test]
    fn ttl_expiration_evicts_entries() {
        let now = Instant::now();
        let cache = IdempotencyCache::new(Duration::from_secs(1));
        cache.record("k1", CachedResponse::new("ok", serde_json::Value::Null), now);

        assert!(cache.lookup("k1", now + Duration::from_millis(500)).is_some());
        assert!(cache.lookup("k1", now + Duration::from_secs(2)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let now = Instant::now();
        let cache = IdempotencyCache::new(Duration::from_secs(10));
        cache.record("old", CachedResponse::new("ok", serde_json::Value::Null), now);
        cache.record(
            "new",
            CachedResponse::new("ok", serde_json::Value::Null),
            now + Duration::from_secs(5),
        );

        assert_eq!(cache.sweep(now + Duration::from_secs(10)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("new", now + Duration::from_secs(10)).is_some());
    }
}
