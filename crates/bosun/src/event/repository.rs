//! Event log persistence.

use anyhow::{Context, Result};
use bosun_protocol::EventSource;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use super::models::{EventFilter, EventRow, StoredEvent};

/// All event columns for SELECT queries.
const EVENT_COLUMNS: &str = "id, session_id, ts, source, kind, payload";

/// Repository for the append-only event log.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event and update the owning session's and repository's
    /// metadata in one transaction. Nothing is visible to readers until the
    /// transaction commits.
    pub async fn append_with_metadata(
        &self,
        session_id: &str,
        repo_id: &str,
        source: EventSource,
        kind: &str,
        payload: Value,
    ) -> Result<StoredEvent> {
        let ts = Utc::now().to_rfc3339();
        let payload_text = serde_json::to_string(&payload).context("encoding event payload")?;

        let mut tx = self.pool.begin().await.context("beginning ingest tx")?;

        let result = sqlx::query(
            "INSERT INTO events (session_id, ts, source, kind, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&ts)
        .bind(source.to_string())
        .bind(kind)
        .bind(&payload_text)
        .execute(&mut *tx)
        .await
        .context("inserting event")?;

        let id = result.last_insert_rowid();

        sqlx::query("UPDATE sessions SET last_event_id = ?, updated_at = ? WHERE id = ?")
            .bind(id)
            .bind(&ts)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("updating session metadata")?;

        sqlx::query("UPDATE repos SET last_activity_at = ? WHERE id = ?")
            .bind(&ts)
            .bind(repo_id)
            .execute(&mut *tx)
            .await
            .context("updating repo activity")?;

        tx.commit().await.context("committing ingest tx")?;

        Ok(StoredEvent {
            id,
            session_id: session_id.to_string(),
            ts,
            source,
            kind: kind.to_string(),
            payload,
        })
    }

    /// List a session's events with optional id bounds, source/kind filters
    /// and ordering.
    pub async fn list_by_session(
        &self,
        session_id: &str,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>> {
        let mut sql = format!(
            "SELECT {} FROM events WHERE session_id = ?",
            EVENT_COLUMNS
        );
        if filter.after.is_some() {
            sql.push_str(" AND id > ?");
        }
        if filter.before.is_some() {
            sql.push_str(" AND id < ?");
        }
        if filter.source.is_some() {
            sql.push_str(" AND source = ?");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        sql.push_str(&format!(" ORDER BY id {} LIMIT ?", filter.order.sql()));

        let mut query = sqlx::query_as::<_, EventRow>(&sql).bind(session_id);
        if let Some(after) = filter.after {
            query = query.bind(after);
        }
        if let Some(before) = filter.before {
            query = query.bind(before);
        }
        if let Some(source) = filter.source {
            query = query.bind(source.to_string());
        }
        if let Some(ref kind) = filter.kind {
            query = query.bind(kind.clone());
        }
        query = query.bind(filter.limit as i64);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("listing events")?;

        rows.into_iter().map(EventRow::into_event).collect()
    }
}
