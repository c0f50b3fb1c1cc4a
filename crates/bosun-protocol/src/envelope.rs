//! The versioned message envelope.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only envelope version this protocol speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors produced while decoding an envelope off the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The text was not a JSON object or is missing required fields.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The `v` field is present but not a version we understand.
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(i64),
}

/// Envelope kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// An agent or runner event (sandbox -> core) or a stored event
    /// broadcast (core -> observer).
    Event,
    /// An observer command (observer -> core) or a command forwarded to a
    /// sandbox (core -> sandbox).
    Command,
    /// Acknowledgement of a command or ingested event; also carries the
    /// heartbeat ping.
    Ack,
    /// A failure report tied to the sender's offending envelope.
    Error,
    /// Reserved for subscription control frames.
    Subscribe,
    /// A snapshot reply.
    Snapshot,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Event => write!(f, "event"),
            EnvelopeKind::Command => write!(f, "command"),
            EnvelopeKind::Ack => write!(f, "ack"),
            EnvelopeKind::Error => write!(f, "error"),
            EnvelopeKind::Subscribe => write!(f, "subscribe"),
            EnvelopeKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// A single self-describing message.
///
/// `seq` is strictly increasing per emitter starting at 1; `ts` is set by
/// the emitter and never adjusted in transit. Unknown fields are ignored on
/// decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub v: u32,
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub session_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: EnvelopeKind, session_id: Option<String>, seq: u64, payload: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            session_id,
            ts: Utc::now(),
            seq,
            payload,
        }
    }

    /// Serialize to the single-line JSON wire form.
    pub fn encode(&self) -> String {
        // Envelope fields are always serializable.
        serde_json::to_string(self).expect("envelope serialization")
    }

    /// Parse an envelope from wire text.
    ///
    /// The transport carrier may wrap the envelope in an outer
    /// `{type, data}` object; that wrapper is stripped transparently. An
    /// unknown or missing version tag is rejected.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        // Unwrap a `{type, data}` carrier frame if the inner object looks
        // like an envelope.
        if value.get("v").is_none()
            && value.get("type").is_some()
            && value.get("data").is_some()
        {
            value = value["data"].take();
        }

        match value.get("v").and_then(Value::as_i64) {
            Some(v) if v == PROTOCOL_VERSION as i64 => {}
            Some(v) => return Err(ProtocolError::UnsupportedVersion(v)),
            None => {
                return Err(ProtocolError::Malformed(
                    "missing or non-numeric version tag".to_string(),
                ));
            }
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Monotone per-emitter sequence number source.
///
/// The first call to [`Sequencer::next`] returns 1.
#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip() {
        let env = Envelope::new(
            EnvelopeKind::Event,
            Some("sess-1".to_string()),
            7,
            json!({"runnerEvent": {"type": "process.started"}}),
        );
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let text = r#"{"v":2,"kind":"event","sessionId":null,"ts":"2026-01-01T00:00:00Z","seq":1,"payload":{}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn decode_rejects_missing_version() {
        let text = r#"{"kind":"event","ts":"2026-01-01T00:00:00Z","seq":1,"payload":{}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn decode_unwraps_carrier_frame() {
        let inner = Envelope::new(EnvelopeKind::Ack, None, 3, json!({"ping": true}));
        let wrapped = json!({"type": "message", "data": inner}).to_string();
        let decoded = Envelope::decode(&wrapped).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let text = r#"{"v":1,"kind":"ack","sessionId":null,"ts":"2026-01-01T00:00:00Z","seq":1,"payload":{},"extra":"ignored"}"#;
        let decoded = Envelope::decode(text).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::Ack);
    }

    #[test]
    fn sequencer_starts_at_one_and_increases() {
        let seq = Sequencer::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next(), 3);
    }
}
