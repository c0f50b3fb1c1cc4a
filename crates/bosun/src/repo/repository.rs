//! Repository persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::Repo;

/// All repo columns for SELECT queries.
const REPO_COLUMNS: &str = r#"
    id, owner, name, default_branch, created_at, updated_at, last_activity_at
"#;

/// Persistence for registered repositories.
#[derive(Debug, Clone)]
pub struct RepoRepository {
    pool: SqlitePool,
}

impl RepoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a newly registered repository.
    pub async fn insert(&self, repo: &Repo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repos (id, owner, name, default_branch, created_at, updated_at, last_activity_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&repo.id)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(&repo.default_branch)
        .bind(&repo.created_at)
        .bind(&repo.updated_at)
        .bind(&repo.last_activity_at)
        .execute(&self.pool)
        .await
        .context("inserting repo")?;

        Ok(())
    }

    /// Get a repository by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Repo>> {
        let query = format!("SELECT {} FROM repos WHERE id = ?", REPO_COLUMNS);
        let repo = sqlx::query_as::<_, Repo>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching repo")?;

        Ok(repo)
    }

    /// Find a repository by its owner/name pair.
    pub async fn find_by_owner_name(&self, owner: &str, name: &str) -> Result<Option<Repo>> {
        let query = format!(
            "SELECT {} FROM repos WHERE owner = ? AND name = ?",
            REPO_COLUMNS
        );
        let repo = sqlx::query_as::<_, Repo>(&query)
            .bind(owner)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("fetching repo by owner/name")?;

        Ok(repo)
    }

    /// List repositories ordered by last activity, most recent first.
    pub async fn list_ordered(&self) -> Result<Vec<Repo>> {
        let query = format!(
            "SELECT {} FROM repos ORDER BY last_activity_at IS NULL, last_activity_at DESC, updated_at DESC",
            REPO_COLUMNS
        );
        let repos = sqlx::query_as::<_, Repo>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing repos")?;

        Ok(repos)
    }

    /// Delete a repository. Session and event rows cascade.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM repos WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting repo")?;

        Ok(())
    }

    /// Update the last-activity timestamp.
    pub async fn touch_activity(&self, id: &str, ts: &str) -> Result<()> {
        sqlx::query("UPDATE repos SET last_activity_at = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching repo activity")?;

        Ok(())
    }
}
