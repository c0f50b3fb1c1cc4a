//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::container::SandboxRuntimeApi;
use crate::db::Database;
use crate::event::{EventIngest, EventRepository};
use crate::forge::ForgeApi;
use crate::git::SourceControlApi;
use crate::repo::{RepoRepository, RepoService};
use crate::session::{SessionRepository, SessionService, SessionServiceConfig};
use crate::snapshot::SnapshotService;
use crate::ws::{ConnectionRegistry, SubscriptionHub};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: Arc<SubscriptionHub>,
    pub sessions: Arc<SessionService>,
    pub repos: Arc<RepoService>,
    pub snapshots: Arc<SnapshotService>,
    /// Sandbox heartbeat expectation.
    pub heartbeat_interval: Duration,
}

impl AppState {
    /// Wire up all services around the database pool and facades.
    pub fn new(
        db: Database,
        git: Arc<dyn SourceControlApi>,
        forge: Arc<dyn ForgeApi>,
        runtime: Arc<dyn SandboxRuntimeApi>,
        settings: &Settings,
    ) -> Self {
        let pool = db.pool().clone();
        let repo_repository = RepoRepository::new(pool.clone());
        let session_repository = SessionRepository::new(pool.clone());
        let event_repository = EventRepository::new(pool.clone());

        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Arc::new(SubscriptionHub::new(registry.clone()));
        let ingest = EventIngest::new(event_repository.clone(), hub.clone());

        let session_config = SessionServiceConfig {
            container_image: settings.container_image.clone(),
            port: settings.port,
            idle_timeout_seconds: settings.idle_timeout_seconds,
            base_system_prompt: settings.base_system_prompt.clone(),
            ..Default::default()
        };
        let sessions = SessionService::new(
            session_repository.clone(),
            repo_repository.clone(),
            ingest,
            registry.clone(),
            git.clone(),
            forge.clone(),
            runtime,
            session_config,
        );
        let repos = RepoService::new(
            repo_repository.clone(),
            session_repository.clone(),
            git,
            forge,
        );
        let snapshots = SnapshotService::new(
            pool,
            repo_repository,
            session_repository,
            event_repository,
        );

        Self {
            db,
            registry,
            hub,
            sessions: Arc::new(sessions),
            repos: Arc::new(repos),
            snapshots: Arc::new(snapshots),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
        }
    }
}
