//! Sandbox start configuration and validation.

use std::collections::HashMap;

use bosun_protocol::SessionRole;

use super::error::{SandboxError, SandboxResult};

/// Mount point of the session worktree inside the sandbox.
pub const WORKTREE_MOUNT: &str = "/workspace";

/// Inputs for starting one session's sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Owning session.
    pub session_id: String,
    /// Host path of the session worktree; mounted at [`WORKTREE_MOUNT`].
    pub worktree_path: String,
    /// Hosting-service access token handed to the agent's git remote.
    pub token: String,
    /// URL the sandbox dials back to reach the control plane.
    pub manager_url: String,
    /// Container image.
    pub image: String,
    /// Agent role.
    pub role: SessionRole,
    /// Initial prompt, if any.
    pub goal: Option<String>,
    /// Model override, if any.
    pub model: Option<String>,
    /// Text prepended to the agent system prompt.
    pub base_system_prompt: Option<String>,
    /// Quiet interval after which the sandbox declares the session idle.
    pub idle_timeout_seconds: u64,
    /// Additional environment, applied last.
    pub extra_env: HashMap<String, String>,
}

impl SandboxConfig {
    /// The container name for this session's sandbox.
    pub fn container_name(&self) -> String {
        let short = &self.session_id[..self.session_id.len().min(8)];
        format!("bosun-{}", short)
    }

    /// Environment handed to the sandbox process.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = vec![
            ("BOSUN_SESSION_ID".to_string(), self.session_id.clone()),
            ("BOSUN_MANAGER_URL".to_string(), self.manager_url.clone()),
            ("BOSUN_ROLE".to_string(), self.role.to_string()),
            (
                "BOSUN_IDLE_TIMEOUT_SECONDS".to_string(),
                self.idle_timeout_seconds.to_string(),
            ),
            ("GIT_TOKEN".to_string(), self.token.clone()),
        ];
        if let Some(ref goal) = self.goal {
            env.push(("BOSUN_GOAL".to_string(), goal.clone()));
        }
        if let Some(ref model) = self.model {
            env.push(("BOSUN_MODEL".to_string(), model.clone()));
        }
        if let Some(ref prompt) = self.base_system_prompt {
            env.push(("BOSUN_BASE_SYSTEM_PROMPT".to_string(), prompt.clone()));
        }
        for (key, value) in &self.extra_env {
            env.push((key.clone(), value.clone()));
        }
        env
    }

    /// Validate all inputs before shelling out to the runtime.
    pub fn validate(&self) -> SandboxResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.container_name())?;
        if self.worktree_path.is_empty() || self.worktree_path.contains(':') {
            return Err(SandboxError::rejected(
                "worktree path",
                self.worktree_path.clone(),
            ));
        }
        for (key, _) in self.env() {
            validate_env_var_key(&key)?;
        }
        Ok(())
    }
}

/// Inspection result for a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    /// Runtime state string (`running`, `exited`, ...).
    pub status: String,
    /// Exit code, present once the container has exited.
    pub exit_code: Option<i64>,
}

/// Health probe result for the runtime itself.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub ok: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

pub(crate) fn validate_image_name(image: &str) -> SandboxResult<()> {
    if image.is_empty() || image.len() > 256 {
        return Err(SandboxError::rejected(
            "image name",
            "must be 1-256 characters",
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) {
        return Err(SandboxError::rejected(
            "image name",
            format!("'{}' contains invalid characters", image),
        ));
    }
    Ok(())
}

pub(crate) fn validate_container_name(name: &str) -> SandboxResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(SandboxError::rejected(
            "container name",
            "must be 1-128 characters",
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(SandboxError::rejected(
            "container name",
            format!("'{}' contains invalid characters", name),
        ));
    }
    Ok(())
}

pub(crate) fn validate_env_var_key(key: &str) -> SandboxResult<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || key.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(SandboxError::rejected("environment key", key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SandboxConfig {
        SandboxConfig {
            session_id: "0a1b2c3d4e5f".to_string(),
            worktree_path: "/tmp/worktrees/0a1b2c3d4e5f".to_string(),
            token: "token".to_string(),
            manager_url: "ws://host.docker.internal:41500/ws".to_string(),
            image: "bosun-sandbox:latest".to_string(),
            role: SessionRole::Implementer,
            goal: Some("Fix the bug".to_string()),
            model: None,
            base_system_prompt: None,
            idle_timeout_seconds: 30,
            extra_env: HashMap::new(),
        }
    }

    #[test]
    fn container_name_uses_short_session_id() {
        assert_eq!(config().container_name(), "bosun-0a1b2c3d");
    }

    #[test]
    fn env_carries_session_contract() {
        let env = config().env();
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("BOSUN_SESSION_ID").as_deref(), Some("0a1b2c3d4e5f"));
        assert_eq!(get("BOSUN_ROLE").as_deref(), Some("implementer"));
        assert_eq!(get("BOSUN_GOAL").as_deref(), Some("Fix the bug"));
        assert_eq!(get("GIT_TOKEN").as_deref(), Some("token"));
    }

    #[test]
    fn rejects_shady_image_names() {
        let mut cfg = config();
        cfg.image = "evil image; rm -rf /".to_string();
        assert!(cfg.validate().is_err());
    }
}
