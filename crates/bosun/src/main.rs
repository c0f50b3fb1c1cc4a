//! bosun: local control plane for AI coding agent sessions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::net::TcpListener;

use bosun::api;
use bosun::config::Settings;
use bosun::container::{SandboxRuntime, SandboxRuntimeApi};
use bosun::db::Database;
use bosun::forge::{ForgeApi, GitHubClient};
use bosun::git::GitCli;
use bosun::state::AppState;
use bosun::supervisor;

#[derive(Parser)]
#[command(name = "bosun", version, about = "Local control plane for AI coding agent sessions")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve,
    /// Verify the environment: container runtime, git, database, hosting
    /// service.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(cli.log_level)
        .init();

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(settings).await,
        Command::Check => check(settings).await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let db = Database::open(&settings.database_url).await?;

    let git = Arc::new(GitCli::new(settings.workspace_root.clone()));
    let forge = Arc::new(GitHubClient::new());
    let runtime = Arc::new(SandboxRuntime::new());
    info!("Using {} container runtime", runtime.runtime_type());

    let state = AppState::new(db, git, forge, runtime, &settings);

    // Crash recovery: orphaned sessions move to error before we accept any
    // traffic.
    state.sessions.reconcile_on_startup().await?;

    supervisor::spawn_heartbeat(state.clone());

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, api::router(state))
        .await
        .context("serving transport")?;

    Ok(())
}

async fn check(settings: Settings) -> Result<()> {
    let runtime = SandboxRuntime::new();
    let health = runtime.check().await;
    match health.version {
        Some(version) => println!(
            "container runtime: ok ({} {})",
            runtime.runtime_type(),
            version
        ),
        None => println!(
            "container runtime: UNAVAILABLE ({})",
            health.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }

    let git_ok = tokio::process::Command::new("git")
        .arg("--version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    println!("git: {}", if git_ok { "ok" } else { "UNAVAILABLE" });

    match Database::open(&settings.database_url).await {
        Ok(_) => println!("database: ok ({})", settings.database_url.display()),
        Err(e) => println!("database: FAILED ({:?})", e),
    }

    let forge = GitHubClient::new();
    match forge.check_auth().await {
        Ok(status) if status.ok => println!(
            "hosting service: ok (authenticated as {})",
            status.user.unwrap_or_default()
        ),
        Ok(status) => println!(
            "hosting service: unauthenticated ({})",
            status.error.unwrap_or_default()
        ),
        Err(e) => println!("hosting service: FAILED ({:?})", e),
    }

    Ok(())
}
