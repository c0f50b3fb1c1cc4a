//! Container facade.
//!
//! Drives sandbox containers through the Podman or Docker CLI. The
//! controller only ever needs six operations (check, start, stop, remove,
//! inspect, host URL), so that is the whole trait. Stop and remove treat a
//! container that is already gone as success, which keeps the teardown
//! paths idempotent under crashes and retries.

mod container;
mod error;

pub use container::{RuntimeHealth, SandboxConfig, SandboxInfo, WORKTREE_MOUNT};
pub use error::{SandboxError, SandboxResult};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;

/// Which CLI the facade drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeType {
    /// Podman, assumed on Linux hosts.
    #[default]
    Podman,
    /// Docker, the usual choice on developer machines.
    Docker,
}

impl RuntimeType {
    fn binary(self) -> &'static str {
        match self {
            RuntimeType::Podman => "podman",
            RuntimeType::Docker => "docker",
        }
    }

    /// Suffix appended to `-v` mounts. Podman volumes need the SELinux
    /// relabel flag or the sandbox cannot read its worktree.
    fn volume_suffix(self) -> &'static str {
        match self {
            RuntimeType::Podman => ":Z",
            RuntimeType::Docker => "",
        }
    }

    /// Name under which containers reach services bound on the host.
    fn host_alias(self) -> &'static str {
        match self {
            RuntimeType::Podman => "host.containers.internal",
            RuntimeType::Docker => "host.docker.internal",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

/// Sandbox runtime abstraction for testability.
#[async_trait]
pub trait SandboxRuntimeApi: Send + Sync {
    /// Check the runtime is present and answering.
    async fn check(&self) -> RuntimeHealth;

    /// Start a sandbox container; returns its handle.
    async fn start(&self, config: &SandboxConfig) -> SandboxResult<String>;

    /// Signal the sandbox with a grace period, then kill.
    async fn stop(&self, handle: &str, grace_seconds: Option<u32>) -> SandboxResult<()>;

    /// Remove the container.
    async fn remove(&self, handle: &str, force: bool) -> SandboxResult<()>;

    /// Inspect a container; None if it no longer exists.
    async fn info(&self, handle: &str) -> SandboxResult<Option<SandboxInfo>>;

    /// URL under which containers reach a port on the host.
    fn host_url(&self, port: u16) -> String;
}

/// CLI-backed sandbox runtime.
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for SandboxRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxRuntime {
    /// Pick whichever runtime is on PATH, macs first trying Docker and
    /// everything else trying Podman. With neither installed the first
    /// runtime call reports `Unavailable`.
    pub fn new() -> Self {
        let candidates = if cfg!(target_os = "macos") {
            [RuntimeType::Docker, RuntimeType::Podman]
        } else {
            [RuntimeType::Podman, RuntimeType::Docker]
        };
        for runtime_type in candidates {
            if Self::binary_on_path(runtime_type.binary()) {
                return Self::with_type(runtime_type);
            }
        }
        Self::with_type(RuntimeType::default())
    }

    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.binary().to_string(),
            runtime_type,
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn binary_on_path(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, op: &str, args: &[String]) -> SandboxResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| SandboxError::Unavailable {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SandboxError::RuntimeFailed {
                binary: self.binary.clone(),
                op: op.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn is_not_found(err: &SandboxError) -> bool {
        match err {
            SandboxError::RuntimeFailed { stderr, .. } => {
                let lower = stderr.to_lowercase();
                lower.contains("no such container")
                    || lower.contains("no container with name or id")
            }
            _ => false,
        }
    }
}

/// Subset of `inspect` output the controller cares about.
#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
}

#[async_trait]
impl SandboxRuntimeApi for SandboxRuntime {
    async fn check(&self) -> RuntimeHealth {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Client.Version}}".to_string(),
        ];
        match self.run("version", &args).await {
            Ok(version) => RuntimeHealth {
                ok: true,
                version: Some(version),
                error: None,
            },
            Err(e) => RuntimeHealth {
                ok: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn start(&self, config: &SandboxConfig) -> SandboxResult<String> {
        config.validate()?;

        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        args.push("--name".to_string());
        args.push(config.container_name());

        args.push("-v".to_string());
        args.push(format!(
            "{}:{}{}",
            config.worktree_path,
            WORKTREE_MOUNT,
            self.runtime_type.volume_suffix()
        ));

        args.push("-w".to_string());
        args.push(WORKTREE_MOUNT.to_string());

        for (key, value) in config.env() {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());

        let handle = self.run("run", &args).await?;
        info!(
            "Started sandbox {} for session {}",
            handle, config.session_id
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &str, grace_seconds: Option<u32>) -> SandboxResult<()> {
        let mut args = vec!["stop".to_string()];
        if let Some(grace) = grace_seconds {
            args.push("-t".to_string());
            args.push(grace.to_string());
        }
        args.push(handle.to_string());

        match self.run("stop", &args).await {
            Ok(_) => {
                debug!("Stopped sandbox {}", handle);
                Ok(())
            }
            // Stopping a stopped or missing container is success.
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, handle: &str, force: bool) -> SandboxResult<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(handle.to_string());

        match self.run("rm", &args).await {
            Ok(_) => {
                debug!("Removed sandbox {}", handle);
                Ok(())
            }
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn info(&self, handle: &str) -> SandboxResult<Option<SandboxInfo>> {
        let args = vec!["inspect".to_string(), handle.to_string()];
        let output = match self.run("inspect", &args).await {
            Ok(output) => output,
            Err(e) if Self::is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        let entries: Vec<InspectEntry> = serde_json::from_str(&output)?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        Ok(Some(SandboxInfo {
            status: entry.state.status,
            exit_code: entry.state.exit_code,
        }))
    }

    fn host_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.runtime_type.host_alias(), port)
    }
}

/// Warn-level convenience for best-effort teardown.
pub async fn reap_container(runtime: &dyn SandboxRuntimeApi, handle: &str) {
    if let Err(e) = runtime.stop(handle, Some(10)).await {
        warn!("Failed to stop container {}: {:?}", handle, e);
    }
    if let Err(e) = runtime.remove(handle, true).await {
        warn!("Failed to remove container {}: {:?}", handle, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_alias_per_runtime() {
        assert_eq!(
            SandboxRuntime::with_type(RuntimeType::Docker).host_url(41500),
            "http://host.docker.internal:41500"
        );
        assert_eq!(
            SandboxRuntime::with_type(RuntimeType::Podman).host_url(41500),
            "http://host.containers.internal:41500"
        );
    }

    #[test]
    fn podman_mounts_carry_the_relabel_flag() {
        assert_eq!(RuntimeType::Podman.volume_suffix(), ":Z");
        assert_eq!(RuntimeType::Docker.volume_suffix(), "");
    }

    #[test]
    fn missing_containers_are_recognized_from_stderr() {
        let err = SandboxError::RuntimeFailed {
            binary: "podman".to_string(),
            op: "stop".to_string(),
            stderr: "Error: no container with name or id bosun-0a1b2c3d".to_string(),
        };
        assert!(SandboxRuntime::is_not_found(&err));
    }

    #[test]
    fn inspect_parsing() {
        let raw = r#"[{"State":{"Status":"exited","ExitCode":0}}]"#;
        let entries: Vec<InspectEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].state.status, "exited");
        assert_eq!(entries[0].state.exit_code, Some(0));
    }
}
