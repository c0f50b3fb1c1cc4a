//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML config file,
//! then `BOSUN_`-prefixed process environment variables (last wins).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// Default transport listen port.
const DEFAULT_PORT: u16 = 41500;

/// Default quiet interval before the sandbox reports idle, in seconds.
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 30;

/// Default heartbeat expectation for sandbox connections, in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default sandbox container image.
const DEFAULT_CONTAINER_IMAGE: &str = "bosun-sandbox:latest";

/// Resolved settings for the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Location of the durable store (SQLite file path).
    #[serde(alias = "databaseUrl")]
    pub database_url: PathBuf,

    /// Observer/sandbox transport listen port.
    pub port: u16,

    /// Parent directory for mirrors and worktrees.
    #[serde(alias = "workspaceRoot")]
    pub workspace_root: PathBuf,

    /// Default image for sandbox containers.
    #[serde(alias = "containerImage")]
    pub container_image: String,

    /// Quiet interval after which the sandbox declares the session idle.
    #[serde(alias = "idleTimeoutSeconds")]
    pub idle_timeout_seconds: u64,

    /// Sandbox heartbeat expectation.
    #[serde(alias = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,

    /// Text prepended to the agent system prompt.
    #[serde(default, alias = "baseSystemPrompt")]
    pub base_system_prompt: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bosun");
        Self {
            database_url: data_dir.join("bosun.db"),
            port: DEFAULT_PORT,
            workspace_root: data_dir.join("workspaces"),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            base_system_prompt: None,
        }
    }
}

impl Settings {
    /// Load settings, layering an optional config file and the environment
    /// over the defaults.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();

        let mut builder = Config::builder()
            .set_default("database_url", defaults.database_url.display().to_string())?
            .set_default("port", defaults.port as i64)?
            .set_default(
                "workspace_root",
                defaults.workspace_root.display().to_string(),
            )?
            .set_default("container_image", defaults.container_image.clone())?
            .set_default("idle_timeout_seconds", defaults.idle_timeout_seconds as i64)?
            .set_default(
                "heartbeat_interval_ms",
                defaults.heartbeat_interval_ms as i64,
            )?;

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("BOSUN"));

        let settings = builder
            .build()
            .context("assembling configuration")?
            .try_deserialize::<Settings>()
            .context("deserializing configuration")?;

        Ok(settings)
    }
}
