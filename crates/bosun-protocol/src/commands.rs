//! Observer and sandbox command payloads.

use serde::{Deserialize, Serialize};

use crate::events::SessionRole;

/// Snapshot targets for `snapshot.request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotTarget {
    Repos,
    Sessions,
    Events,
}

/// Commands sent by observers inside `command` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Start a new agent session against a registered repository.
    #[serde(rename = "session.start", rename_all = "camelCase")]
    SessionStart {
        repo_id: String,
        role: SessionRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        goal_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Stop a session; idempotent on already-stopped sessions.
    #[serde(rename = "session.stop", rename_all = "camelCase")]
    SessionStop { session_id: String },

    /// Relay a user message to the session's sandbox.
    #[serde(rename = "session.send_message", rename_all = "camelCase")]
    SessionSendMessage {
        session_id: String,
        message: String,
        #[serde(default)]
        force: bool,
    },

    /// Subscribe to the repository list topic.
    #[serde(rename = "subscribe.repo_list")]
    SubscribeRepoList,

    /// Subscribe to one repository's topic.
    #[serde(rename = "subscribe.repo", rename_all = "camelCase")]
    SubscribeRepo { repo_id: String },

    /// Subscribe to one session's topic.
    #[serde(rename = "subscribe.session", rename_all = "camelCase")]
    SubscribeSession { session_id: String },

    /// Drop a subscription by its topic key.
    #[serde(rename = "unsubscribe", rename_all = "camelCase")]
    Unsubscribe { subscription_id: String },

    /// Request a point-in-time snapshot.
    #[serde(rename = "snapshot.request", rename_all = "camelCase")]
    SnapshotRequest {
        target: SnapshotTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_event_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

impl Command {
    /// The session a command targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Command::SessionStop { session_id }
            | Command::SessionSendMessage { session_id, .. }
            | Command::SubscribeSession { session_id } => Some(session_id),
            Command::SnapshotRequest { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

/// Commands the core forwards to a sandbox over its connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxCommand {
    /// A user message for the agent to act on.
    UserMessage { message: String },
    /// Ask the sandbox to wind down before the container is signalled.
    Stop,
}
