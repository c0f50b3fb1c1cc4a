//! Repository data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered remote source-tree namespace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    /// Unique repository ID.
    pub id: String,
    /// Namespace (owner) on the hosting service.
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// Default branch label.
    pub default_branch: String,
    /// When the repository was registered.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
    /// Timestamp of the most recent event across the repo's sessions.
    pub last_activity_at: Option<String>,
}

impl Repo {
    /// Slug form used in logs and branch labels.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}
