//! Envelope definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of payload moving through a stream.
///
/// Immutable once enqueued; the broker only ever moves it between the pending
/// FIFO and the inflight set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope ID, unique within its stream.
    pub id: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Producer timestamp (defaults to the enqueue time).
    pub ts: DateTime<Utc>,
}

/// Envelope as submitted by a producer.
///
/// `id` and `ts` are optional; the broker fills them in on enqueue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

impl EnvelopeDraft {
    /// Create a draft carrying only a payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: None,
            payload,
            ts: None,
        }
    }

    /// Set an explicit envelope ID.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Finalize the draft, assigning `fallback_id` and `now` where missing.
    pub fn seal(self, fallback_id: impl FnOnce() -> String, now: DateTime<Utc>) -> Envelope {
        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => fallback_id(),
        };
        Envelope {
            id,
            payload: self.payload,
            ts: self.ts.unwrap_or(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_keeps_supplied_id_and_ts() {
        let ts = DateTime::parse_from_rfc3339("2024-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let draft = EnvelopeDraft {
            id: Some("env-1".to_string()),
            payload: serde_json::json!({"n": 1}),
            ts: Some(ts),
        };

        let env = draft.seal(|| "generated".to_string(), Utc::now());
        assert_eq!(env.id, "env-1");
        assert_eq!(env.ts, ts);
        assert_eq!(env.payload["n"], 1);
    }

    #[test]
    fn test_seal_fills_missing_fields() {
        let now = Utc::now();
        let env = EnvelopeDraft::new(serde_json::json!("hi")).seal(|| "generated".to_string(), now);
        assert_eq!(env.id, "generated");
        assert_eq!(env.ts, now);
    }

    #[test]
    fn test_seal_treats_empty_id_as_missing() {
        let env = EnvelopeDraft::new(serde_json::Value::Null)
            .with_id("")
            .seal(|| "generated".to_string(), Utc::now());
        assert_eq!(env.id, "generated");
    }

    #[test]
    fn test_draft_deserializes_without_optional_fields() {
        let draft: EnvelopeDraft = serde_json::from_str(r#"{"payload":[1,2,3]}"#).unwrap();
        assert!(draft.id.is_none());
        assert!(draft.ts.is_none());
        assert_eq!(draft.payload, serde_json::json!([1, 2, 3]));
    }
}
