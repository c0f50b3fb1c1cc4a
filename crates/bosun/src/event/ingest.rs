//! Event ingest: durable append plus real-time fan-out.

use std::sync::Arc;

use anyhow::{Context, Result};
use bosun_protocol::{EnvelopeKind, EventSource};
use serde_json::Value;

use crate::session::Session;
use crate::ws::{repo_topic, session_topic, SubscriptionHub};

use super::repository::EventRepository;
use super::StoredEvent;

/// Accepts events for a session, persists them atomically with the session
/// and repository metadata, and emits the stored representation to the
/// session and repository topics.
#[derive(Clone)]
pub struct EventIngest {
    events: EventRepository,
    hub: Arc<SubscriptionHub>,
}

impl EventIngest {
    pub fn new(events: EventRepository, hub: Arc<SubscriptionHub>) -> Self {
        Self { events, hub }
    }

    /// Persist one event and broadcast it. The broadcast happens only after
    /// the transaction commits; a failed ingest is visible to nobody.
    pub async fn record(
        &self,
        session: &Session,
        source: EventSource,
        kind: &str,
        payload: Value,
    ) -> Result<StoredEvent> {
        let stored = self
            .events
            .append_with_metadata(&session.id, &session.repo_id, source, kind, payload)
            .await?;

        let wire = serde_json::to_value(stored.to_wire()).context("encoding stored event")?;
        self.hub.publish(
            &session_topic(&session.id),
            EnvelopeKind::Event,
            Some(session.id.clone()),
            wire.clone(),
        );
        self.hub.publish(
            &repo_topic(&session.repo_id),
            EnvelopeKind::Event,
            Some(session.id.clone()),
            wire,
        );

        Ok(stored)
    }

    pub fn events(&self) -> &EventRepository {
        &self.events
    }
}
