//! Repository registration service.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::info;
use uuid::Uuid;

use crate::forge::ForgeApi;
use crate::git::SourceControlApi;
use crate::session::SessionRepository;

use super::models::Repo;
use super::repository::RepoRepository;

/// Manages the repository table and enforces its lifecycle rules.
#[derive(Clone)]
pub struct RepoService {
    repos: RepoRepository,
    sessions: SessionRepository,
    git: Arc<dyn SourceControlApi>,
    forge: Arc<dyn ForgeApi>,
}

impl RepoService {
    pub fn new(
        repos: RepoRepository,
        sessions: SessionRepository,
        git: Arc<dyn SourceControlApi>,
        forge: Arc<dyn ForgeApi>,
    ) -> Self {
        Self {
            repos,
            sessions,
            git,
            forge,
        }
    }

    /// Register a repository, resolving its default branch through the
    /// hosting service (falling back to the mirror when the forge has no
    /// answer). Registration is idempotent on the owner/name pair.
    pub async fn register(&self, owner: &str, name: &str) -> Result<Repo> {
        if let Some(existing) = self.repos.find_by_owner_name(owner, name).await? {
            return Ok(existing);
        }

        let default_branch = match self.forge.get_repo(owner, name).await? {
            Some(forge_repo) => forge_repo.default_branch,
            None => self.git.default_branch_of(owner, name).await?,
        };

        let now = Utc::now().to_rfc3339();
        let repo = Repo {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            default_branch,
            created_at: now.clone(),
            updated_at: now,
            last_activity_at: None,
        };
        self.repos.insert(&repo).await?;

        info!("Registered repo {} as {}", repo.full_name(), repo.id);
        Ok(repo)
    }

    /// Delete a repository. Refused while any non-terminal session still
    /// references it; the store cascades session and event rows.
    pub async fn delete(&self, repo_id: &str) -> Result<()> {
        let active = self.sessions.count_non_terminal_for_repo(repo_id).await?;
        if active > 0 {
            anyhow::bail!(
                "repo {} still has {} non-terminal session(s)",
                repo_id,
                active
            );
        }

        self.repos.delete(repo_id).await?;
        info!("Deleted repo {}", repo_id);
        Ok(())
    }

    pub fn repos(&self) -> &RepoRepository {
        &self.repos
    }
}
