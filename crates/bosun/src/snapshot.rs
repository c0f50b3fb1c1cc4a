//! Snapshot service.
//!
//! Read-only, point-in-time views handed to observers on subscription and
//! on explicit request. Snapshots race freely with ongoing writes; the
//! `updatedAt` and `lastEventId` fields let consumers detect staleness.

use anyhow::{Context, Result};
use bosun_protocol::WireEvent;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::event::{EventFilter, EventOrder, EventRepository};
use crate::repo::{Repo, RepoRepository};
use crate::session::{Session, SessionRepository, SessionStatus};

/// Default number of tail events returned.
pub const DEFAULT_EVENT_LIMIT: u32 = 100;

/// Upper bound on a caller-supplied event limit.
pub const MAX_EVENT_LIMIT: u32 = 1000;

/// Clamp a caller-supplied limit into `1..=MAX_EVENT_LIMIT`.
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT)
}

/// A repository with derived session counts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    #[serde(flatten)]
    pub repo: Repo,
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub has_running: bool,
    pub has_waiting: bool,
    pub has_error: bool,
}

/// A session with derived observer hints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub needs_input: bool,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        let needs_input = session.status == SessionStatus::Waiting;
        Self {
            session,
            needs_input,
        }
    }
}

/// One repository's sessions, most recently updated first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoView {
    pub repo: Repo,
    pub sessions: Vec<SessionView>,
}

/// A session's event tail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsSnapshot {
    pub session_id: String,
    /// Chronological (ascending id) order.
    pub events: Vec<WireEvent>,
    /// Greatest event id returned; resume point for the next request.
    pub cursor: Option<i64>,
    /// Whether further events exist beyond this page.
    pub has_more: bool,
}

/// Produces consistent point-in-time views of repositories, sessions and
/// event tails.
#[derive(Clone)]
pub struct SnapshotService {
    pool: SqlitePool,
    repos: RepoRepository,
    sessions: SessionRepository,
    events: EventRepository,
}

impl SnapshotService {
    pub fn new(
        pool: SqlitePool,
        repos: RepoRepository,
        sessions: SessionRepository,
        events: EventRepository,
    ) -> Self {
        Self {
            pool,
            repos,
            sessions,
            events,
        }
    }

    /// All repositories with derived counts, ordered by last activity.
    pub async fn repo_list(&self) -> Result<Vec<RepoSummary>> {
        let repos = self.repos.list_ordered().await?;
        let mut summaries = Vec::with_capacity(repos.len());
        for repo in repos {
            let counts = self.session_counts(&repo.id).await?;
            summaries.push(RepoSummary {
                repo,
                total_sessions: counts.total,
                active_sessions: counts.active,
                has_running: counts.running > 0,
                has_waiting: counts.waiting > 0,
                has_error: counts.error > 0,
            });
        }
        Ok(summaries)
    }

    /// One repository's sessions in updated-descending order.
    pub async fn repo_view(&self, repo_id: &str) -> Result<Option<RepoView>> {
        let Some(repo) = self.repos.get(repo_id).await? else {
            return Ok(None);
        };
        let sessions = self
            .sessions
            .list_by_repo(repo_id)
            .await?
            .into_iter()
            .map(SessionView::from)
            .collect();
        Ok(Some(RepoView { repo, sessions }))
    }

    /// A session's tail events.
    ///
    /// Without a cursor: the most recent `limit` events, chronological.
    /// With `after`: events with id strictly greater than the cursor. Both
    /// shapes fetch one extra row to learn whether more exist.
    pub async fn session_events(
        &self,
        session_id: &str,
        after: Option<i64>,
        limit: Option<u32>,
    ) -> Result<EventsSnapshot> {
        let limit = clamp_limit(limit);

        let mut events = match after {
            Some(after) => {
                let filter = EventFilter {
                    after: Some(after),
                    limit: limit + 1,
                    order: EventOrder::Ascending,
                    ..Default::default()
                };
                self.events.list_by_session(session_id, &filter).await?
            }
            None => {
                let filter = EventFilter {
                    limit: limit + 1,
                    order: EventOrder::Descending,
                    ..Default::default()
                };
                let mut tail = self.events.list_by_session(session_id, &filter).await?;
                tail.reverse();
                tail
            }
        };

        let has_more = events.len() > limit as usize;
        if has_more {
            match after {
                // Ascending page: trim the extra newest row.
                Some(_) => {
                    events.truncate(limit as usize);
                }
                // Tail page: the extra row is the oldest one.
                None => {
                    events.remove(0);
                }
            }
        }

        let cursor = events.last().map(|e| e.id);
        Ok(EventsSnapshot {
            session_id: session_id.to_string(),
            events: events.iter().map(|e| e.to_wire()).collect(),
            cursor,
            has_more,
        })
    }

    async fn session_counts(&self, repo_id: &str) -> Result<SessionCounts> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status IN ('starting', 'running', 'waiting') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'waiting' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0)
            FROM sessions
            WHERE repo_id = ?
            "#,
        )
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await
        .context("counting repo sessions")?;

        Ok(SessionCounts {
            total: row.0,
            active: row.1,
            running: row.2,
            waiting: row.3,
            error: row.4,
        })
    }
}

struct SessionCounts {
    total: i64,
    active: i64,
    running: i64,
    waiting: i64,
    error: i64,
}
