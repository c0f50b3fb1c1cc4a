//! Session data models.

use bosun_protocol::SessionRole;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Provisioning is in flight.
    Starting,
    /// The agent is working.
    Running,
    /// The agent has paused and awaits input.
    Waiting,
    /// The agent exited cleanly.
    Finished,
    /// Provisioning or the sandbox failed.
    Error,
    /// Stopped by a user command.
    Stopped,
}

impl SessionStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Finished | SessionStatus::Error | SessionStatus::Stopped
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Waiting => write!(f, "waiting"),
            SessionStatus::Finished => write!(f, "finished"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "waiting" => Ok(SessionStatus::Waiting),
            "finished" => Ok(SessionStatus::Finished),
            "error" => Ok(SessionStatus::Error),
            "stopped" => Ok(SessionStatus::Stopped),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

/// A single agent run against a repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Owning repository.
    pub repo_id: String,
    /// Agent role for this run.
    #[sqlx(try_from = "String")]
    pub role: SessionRole,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Branch the worktree is pinned to.
    pub branch: String,
    /// Branch the session branched from.
    pub base_branch: String,
    /// Filesystem path of the working tree (set during provisioning).
    pub worktree_path: Option<String>,
    /// Sandbox container handle (set during provisioning).
    pub container_id: Option<String>,
    /// When the session row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
    /// Set once the session reaches a terminal state.
    pub finished_at: Option<String>,
    /// Greatest event id persisted for this session.
    pub last_event_id: Option<i64>,
    /// Cached head revision of the branch.
    pub head_rev: Option<String>,
    /// Cached pull-request link for the branch.
    pub pr_url: Option<String>,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Branch label for a new session: `agent/<repo-name>/<first-8-of-id>`.
/// Session ids shorter than eight characters use all they have.
pub fn branch_label(repo_name: &str, session_id: &str) -> String {
    let short = &session_id[..session_id.len().min(8)];
    format!("agent/{}/{}", repo_name, short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Waiting,
            SessionStatus::Finished,
            SessionStatus::Error,
            SessionStatus::Stopped,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Waiting.is_terminal());
        assert!(SessionStatus::Finished.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
    }

    #[test]
    fn branch_label_uses_first_eight_chars() {
        assert_eq!(
            branch_label("webapp", "0a1b2c3d4e5f"),
            "agent/webapp/0a1b2c3d"
        );
    }

    #[test]
    fn branch_label_short_session_id() {
        assert_eq!(branch_label("webapp", "abc"), "agent/webapp/abc");
    }
}
