//! Event, ack and error payload shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// A raw agent message.
    Claude,
    /// The sandbox runner process.
    Runner,
    /// Synthesized by the control plane itself.
    Manager,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Claude => write!(f, "claude"),
            EventSource::Runner => write!(f, "runner"),
            EventSource::Manager => write!(f, "manager"),
        }
    }
}

impl std::str::FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(EventSource::Claude),
            "runner" => Ok(EventSource::Runner),
            "manager" => Ok(EventSource::Manager),
            _ => Err(format!("unknown event source: {}", s)),
        }
    }
}

impl TryFrom<String> for EventSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Session role; configures the agent prompt. The core treats both roles
/// identically except for the at-most-one-orchestrator rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Implementer,
    Orchestrator,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Implementer => write!(f, "implementer"),
            SessionRole::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

impl std::str::FromStr for SessionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implementer" => Ok(SessionRole::Implementer),
            "orchestrator" => Ok(SessionRole::Orchestrator),
            _ => Err(format!("unknown session role: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A runner-declared event from the sandbox process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound event payload from a sandbox: either a raw agent message or a
/// runner event. The external serde tag matches the wire shape
/// (`{claudeMessage: ...}` / `{runnerEvent: ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InboundEvent {
    ClaudeMessage(Value),
    RunnerEvent(RunnerEvent),
}

/// Fallback type for agent messages without an inner `type` field.
pub const CLAUDE_MESSAGE_FALLBACK: &str = "claude.message";

impl InboundEvent {
    pub fn source(&self) -> EventSource {
        match self {
            InboundEvent::ClaudeMessage(_) => EventSource::Claude,
            InboundEvent::RunnerEvent(_) => EventSource::Runner,
        }
    }

    /// The structured kind string stored alongside the event.
    pub fn kind(&self) -> String {
        match self {
            InboundEvent::ClaudeMessage(message) => message
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(CLAUDE_MESSAGE_FALLBACK)
                .to_string(),
            InboundEvent::RunnerEvent(event) => event.kind.clone(),
        }
    }

    /// The opaque payload to persist.
    pub fn payload(&self) -> Value {
        match self {
            InboundEvent::ClaudeMessage(message) => message.clone(),
            InboundEvent::RunnerEvent(event) => event.data.clone().unwrap_or(Value::Null),
        }
    }
}

/// The canonical stored event as broadcast to observers; the owning session
/// id travels on the enclosing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: i64,
    pub ts: String,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// Acknowledgement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub command_seq: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Ack {
    pub fn ok(command_seq: u64) -> Self {
        Self {
            command_seq,
            success: true,
            data: None,
        }
    }

    pub fn ok_with(command_seq: u64, data: Value) -> Self {
        Self {
            command_seq,
            success: true,
            data: Some(data),
        }
    }
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_claude_message() {
        let payload: InboundEvent =
            serde_json::from_value(json!({"claudeMessage": {"type": "assistant", "text": "hi"}}))
                .unwrap();
        assert_eq!(payload.source(), EventSource::Claude);
        assert_eq!(payload.kind(), "assistant");
    }

    #[test]
    fn claude_message_kind_falls_back() {
        let payload: InboundEvent =
            serde_json::from_value(json!({"claudeMessage": {"text": "hi"}})).unwrap();
        assert_eq!(payload.kind(), CLAUDE_MESSAGE_FALLBACK);
    }

    #[test]
    fn classifies_runner_event() {
        let payload: InboundEvent = serde_json::from_value(
            json!({"runnerEvent": {"type": "session.idle", "data": {"quietMs": 30000}}}),
        )
        .unwrap();
        assert_eq!(payload.source(), EventSource::Runner);
        assert_eq!(payload.kind(), "session.idle");
        assert_eq!(payload.payload(), json!({"quietMs": 30000}));
    }

    #[test]
    fn wire_event_uses_type_field() {
        let event = WireEvent {
            id: 42,
            ts: "2026-01-01T00:00:00Z".to_string(),
            source: EventSource::Runner,
            kind: "process.started".to_string(),
            payload: Value::Null,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "process.started");
        assert_eq!(json["source"], "runner");
    }
}
