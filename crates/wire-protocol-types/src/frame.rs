//! Frame definitions.
//!
//! Every wire record is a JSON object discriminated by its `type` field.

use crate::{Envelope, EnvelopeDraft};
use serde::{Deserialize, Serialize};

/// Credit units added by a `grant` frame that omits `n`.
pub const DEFAULT_GRANT: u64 = 1;

fn default_grant() -> u64 {
    DEFAULT_GRANT
}

/// Frame types a client may send.
const CLIENT_FRAME_TYPES: &[&str] = &[
    "hello",
    "enqueue",
    "subscribe",
    "grant",
    "ack",
    "nack",
    "stats",
    "snapshot",
    "metrics",
];

/// Frames sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Open the handshake.
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
    },

    /// Append `env` to stream `to`.
    #[serde(rename_all = "camelCase")]
    Enqueue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        to: String,
        env: EnvelopeDraft,
        /// Replays the recorded outcome when the same key is seen again.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
    },

    /// Bind this session to `stream`.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        stream: String,
    },

    /// Add `n` credit units to the session balance.
    #[serde(rename_all = "camelCase")]
    Grant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        #[serde(default = "default_grant")]
        n: u64,
    },

    /// Confirm processing of envelope `id`.
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        id: String,
    },

    /// Reject envelope `id`; it is requeued at the head of its stream.
    #[serde(rename_all = "camelCase")]
    Nack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        id: String,
    },

    /// Request stats for one stream.
    #[serde(rename_all = "camelCase")]
    Stats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        stream: String,
    },

    /// Request a point-in-time dump of every stream.
    #[serde(rename_all = "camelCase")]
    Snapshot { req_id: String },

    /// Request aggregate stats across all streams.
    #[serde(rename_all = "camelCase")]
    Metrics { req_id: String },
}

impl ClientFrame {
    /// The request ID, if the frame carries one.
    pub fn req_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Hello { req_id }
            | ClientFrame::Enqueue { req_id, .. }
            | ClientFrame::Subscribe { req_id, .. }
            | ClientFrame::Grant { req_id, .. }
            | ClientFrame::Ack { req_id, .. }
            | ClientFrame::Nack { req_id, .. }
            | ClientFrame::Stats { req_id, .. } => req_id.as_deref(),
            ClientFrame::Snapshot { req_id } | ClientFrame::Metrics { req_id } => Some(req_id),
        }
    }

    /// The wire `type` of this frame.
    pub fn frame_type(&self) -> &'static str {
        match self {
            ClientFrame::Hello { .. } => "hello",
            ClientFrame::Enqueue { .. } => "enqueue",
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Grant { .. } => "grant",
            ClientFrame::Ack { .. } => "ack",
            ClientFrame::Nack { .. } => "nack",
            ClientFrame::Stats { .. } => "stats",
            ClientFrame::Snapshot { .. } => "snapshot",
            ClientFrame::Metrics { .. } => "metrics",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Success reply to a request-style frame.
    #[serde(rename_all = "camelCase")]
    Ok {
        #[serde(default)]
        req_id: Option<String>,
        result: serde_json::Value,
    },

    /// Failure reply.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        req_id: Option<String>,
        code: ErrorCode,
        #[serde(default)]
        detail: serde_json::Value,
    },

    /// Envelope handed to a consumer.
    Deliver { env: Envelope },
}

impl ServerFrame {
    /// Create a success reply.
    pub fn ok(req_id: Option<&str>, result: serde_json::Value) -> Self {
        ServerFrame::Ok {
            req_id: req_id.map(String::from),
            result,
        }
    }

    /// Create an error reply.
    pub fn error(req_id: Option<&str>, code: ErrorCode, detail: impl Into<serde_json::Value>) -> Self {
        ServerFrame::Error {
            req_id: req_id.map(String::from),
            code,
            detail: detail.into(),
        }
    }

    /// Create a delivery.
    pub fn deliver(env: Envelope) -> Self {
        ServerFrame::Deliver { env }
    }

    /// Check if the frame is an `ok` reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, ServerFrame::Ok { .. })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Protocol-level error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown frame type.
    Unsupported,
    /// Request received before `hello`.
    NotReady,
    /// Known frame type with missing or mistyped fields.
    BadFrame,
    /// Unknown stream.
    NotFound,
    /// Stream depth cap reached.
    StreamFull,
    /// A collaborator backend failed.
    BackendUnavailable,
    /// Unexpected handler failure.
    Internal,
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unsupported => "Unsupported",
            ErrorCode::NotReady => "NotReady",
            ErrorCode::BadFrame => "BadFrame",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::StreamFull => "StreamFull",
            ErrorCode::BackendUnavailable => "BackendUnavailable",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of interpreting one inbound wire record.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed client frame.
    Frame(ClientFrame),
    /// A JSON object whose `type` is not part of the taxonomy.
    Unsupported {
        frame_type: String,
        req_id: Option<String>,
    },
    /// A known `type` whose fields failed to parse.
    Invalid {
        frame_type: String,
        req_id: Option<String>,
        detail: String,
    },
}

impl Inbound {
    /// Interpret one wire record (without its terminator).
    ///
    /// Returns `None` for records that are not UTF-8, not a JSON object, or
    /// lack a string `type`; those carry no `reqId` to correlate a reply with.
    pub fn parse(record: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(record).ok()?;
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;
        let frame_type = object.get("type")?.as_str()?.to_string();
        let req_id = object
            .get("reqId")
            .and_then(|v| v.as_str())
            .map(String::from);

        if !CLIENT_FRAME_TYPES.contains(&frame_type.as_str()) {
            return Some(Inbound::Unsupported { frame_type, req_id });
        }

        match serde_json::from_value::<ClientFrame>(value) {
            Ok(frame) => Some(Inbound::Frame(frame)),
            Err(e) => Some(Inbound::Invalid {
                frame_type,
                req_id,
                detail: e.to_string(),
            }),
        }
    }
}
