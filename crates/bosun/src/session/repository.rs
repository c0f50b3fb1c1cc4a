//! Session database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Session, SessionStatus};

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, repo_id, role, status, branch, base_branch, worktree_path, container_id,
    created_at, updated_at, finished_at, last_event_id, head_rev, pr_url
"#;

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new session row.
    pub async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, repo_id, role, status, branch, base_branch, worktree_path, container_id,
                created_at, updated_at, finished_at, last_event_id, head_rev, pr_url
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.repo_id)
        .bind(session.role.to_string())
        .bind(session.status.to_string())
        .bind(&session.branch)
        .bind(&session.base_branch)
        .bind(&session.worktree_path)
        .bind(&session.container_id)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .bind(&session.finished_at)
        .bind(session.last_event_id)
        .bind(&session.head_rev)
        .bind(&session.pr_url)
        .execute(&self.pool)
        .await
        .context("inserting session")?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(session)
    }

    /// List a repository's sessions, most recently updated first.
    pub async fn list_by_repo(&self, repo_id: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE repo_id = ? ORDER BY updated_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by repo")?;

        Ok(sessions)
    }

    /// List all sessions not yet in a terminal state.
    pub async fn list_non_terminal(&self) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE status IN ('starting', 'running', 'waiting') ORDER BY created_at ASC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing non-terminal sessions")?;

        Ok(sessions)
    }

    /// Count non-terminal sessions referencing a repository.
    pub async fn count_non_terminal_for_repo(&self, repo_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE repo_id = ? AND status IN ('starting', 'running', 'waiting')",
        )
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await
        .context("counting non-terminal sessions")?;

        Ok(count.0)
    }

    /// Find a non-terminal orchestrator session for a repository, if any.
    pub async fn find_active_orchestrator(&self, repo_id: &str) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE repo_id = ? AND role = 'orchestrator' AND status IN ('starting', 'running', 'waiting') LIMIT 1",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(repo_id)
            .fetch_optional(&self.pool)
            .await
            .context("finding active orchestrator")?;

        Ok(session)
    }

    /// Update session status.
    pub async fn update_status(&self, id: &str, status: SessionStatus, now: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    /// Move a session into a terminal state, stamping the finished
    /// timestamp.
    pub async fn mark_terminal(&self, id: &str, status: SessionStatus, now: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = ?, finished_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session terminal")?;

        Ok(())
    }

    /// Record the worktree path created during provisioning.
    pub async fn set_worktree_path(&self, id: &str, path: &str, now: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET worktree_path = ?, updated_at = ? WHERE id = ?")
            .bind(path)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting worktree path")?;

        Ok(())
    }

    /// Record the sandbox container handle.
    pub async fn set_container_id(&self, id: &str, container_id: &str, now: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET container_id = ?, updated_at = ? WHERE id = ?")
            .bind(container_id)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting container id")?;

        Ok(())
    }

    /// Clear the sandbox container handle once it is gone.
    pub async fn clear_container_id(&self, id: &str, now: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET container_id = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("clearing container id")?;

        Ok(())
    }

    /// Refresh cached branch details (head revision, pull-request link).
    pub async fn update_branch_caches(
        &self,
        id: &str,
        head_rev: Option<&str>,
        pr_url: Option<&str>,
        now: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET head_rev = ?, pr_url = ?, updated_at = ? WHERE id = ?")
            .bind(head_rev)
            .bind(pr_url)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating branch caches")?;

        Ok(())
    }
}
