//! Event log data models.

use anyhow::{Context, Result};
use bosun_protocol::{EventSource, WireEvent};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;

/// One immutable log entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Store-global monotone id.
    pub id: i64,
    /// Owning session.
    pub session_id: String,
    /// Emitter-side timestamp.
    pub ts: String,
    /// Where the event originated.
    pub source: EventSource,
    /// Structured kind string (e.g. `process.started`, `user.message`).
    pub kind: String,
    /// Opaque structured payload.
    pub payload: Value,
}

impl StoredEvent {
    /// The representation broadcast to observers; the session id travels on
    /// the enclosing envelope.
    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            id: self.id,
            ts: self.ts.clone(),
            source: self.source,
            kind: self.kind.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Raw row shape; payload is stored as JSON text.
#[derive(Debug, FromRow)]
pub(crate) struct EventRow {
    pub id: i64,
    pub session_id: String,
    pub ts: String,
    pub source: String,
    pub kind: String,
    pub payload: String,
}

impl EventRow {
    pub(crate) fn into_event(self) -> Result<StoredEvent> {
        let source: EventSource = self
            .source
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("parsing event source")?;
        let payload: Value =
            serde_json::from_str(&self.payload).context("parsing event payload")?;
        Ok(StoredEvent {
            id: self.id,
            session_id: self.session_id,
            ts: self.ts,
            source,
            kind: self.kind,
            payload,
        })
    }
}

/// Ordering for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrder {
    #[default]
    Ascending,
    Descending,
}

impl EventOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            EventOrder::Ascending => "ASC",
            EventOrder::Descending => "DESC",
        }
    }
}

/// Filter for `list_by_session`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events with id strictly greater than this.
    pub after: Option<i64>,
    /// Only events with id strictly less than this.
    pub before: Option<i64>,
    /// Maximum rows returned.
    pub limit: u32,
    /// Result ordering by id.
    pub order: EventOrder,
    /// Only events from this source.
    pub source: Option<EventSource>,
    /// Only events of this kind.
    pub kind: Option<String>,
}

impl EventFilter {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}
