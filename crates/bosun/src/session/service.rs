//! Session lifecycle controller.
//!
//! Owns the per-session state machine, resource provisioning
//! (mirror -> worktree -> token -> container) and reaping. All operations
//! touching one session run under that session's lock; sessions never
//! contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bosun_protocol::{
    codes, EnvelopeKind, EventSource, InboundEvent, SandboxCommand, SessionRole,
};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::{reap_container, SandboxConfig, SandboxRuntimeApi};
use crate::event::{EventFilter, EventIngest, EventOrder, StoredEvent};
use crate::forge::ForgeApi;
use crate::git::SourceControlApi;
use crate::repo::{Repo, RepoRepository};
use crate::ws::ConnectionRegistry;

use super::models::{branch_label, Session, SessionStatus};
use super::repository::SessionRepository;

/// Failures surfaced to command callers, each naming one wire error code.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("repository already has an active orchestrator session")]
    DuplicateOrchestrator,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is not waiting for input")]
    SessionNotWaiting,

    #[error("session has no connected sandbox")]
    NoContainer,

    #[error("{0}")]
    Invalid(String),

    #[error("event ingest failed: {0}")]
    IngestFailed(#[source] anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    /// The wire error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::RepoNotFound(_) => codes::REPO_NOT_FOUND,
            CommandError::DuplicateOrchestrator => codes::DUPLICATE_ORCHESTRATOR,
            CommandError::SessionNotFound(_) => codes::SESSION_NOT_FOUND,
            CommandError::SessionNotWaiting => codes::SESSION_NOT_WAITING,
            CommandError::NoContainer => codes::NO_CONTAINER,
            CommandError::Invalid(_) => codes::INVALID_MESSAGE,
            CommandError::IngestFailed(_) => codes::INGEST_FAILED,
            CommandError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }
}

/// Inputs for `session.start`.
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub repo_id: String,
    pub role: SessionRole,
    pub base_branch: Option<String>,
    pub goal_prompt: Option<String>,
    pub model: Option<String>,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Default image for sandbox containers.
    pub container_image: String,
    /// Transport port sandboxes dial back to.
    pub port: u16,
    /// Quiet interval handed to the sandbox for idle detection.
    pub idle_timeout_seconds: u64,
    /// Text prepended to the agent system prompt.
    pub base_system_prompt: Option<String>,
    /// Deadline for each provisioning step.
    pub provision_step_timeout: Duration,
    /// Grace period before the container is force-removed on stop.
    pub stop_grace_seconds: u32,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            container_image: "bosun-sandbox:latest".to_string(),
            port: 41500,
            idle_timeout_seconds: 30,
            base_system_prompt: None,
            provision_step_timeout: Duration::from_secs(120),
            stop_grace_seconds: 10,
        }
    }
}

/// Service driving session lifecycles.
#[derive(Clone)]
pub struct SessionService {
    sessions: SessionRepository,
    repos: RepoRepository,
    ingest: EventIngest,
    registry: Arc<ConnectionRegistry>,
    git: Arc<dyn SourceControlApi>,
    forge: Arc<dyn ForgeApi>,
    runtime: Arc<dyn SandboxRuntimeApi>,
    /// Per-session exclusive locks; all session mutations run under them.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Per-repository locks serializing session creation, so the
    /// one-orchestrator check and the insert are atomic per repo.
    repo_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Cancellation handles for provisioning tasks in flight.
    provisioning: Arc<DashMap<String, CancellationToken>>,
    config: SessionServiceConfig,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionRepository,
        repos: RepoRepository,
        ingest: EventIngest,
        registry: Arc<ConnectionRegistry>,
        git: Arc<dyn SourceControlApi>,
        forge: Arc<dyn ForgeApi>,
        runtime: Arc<dyn SandboxRuntimeApi>,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            sessions,
            repos,
            ingest,
            registry,
            git,
            forge,
            runtime,
            locks: Arc::new(DashMap::new()),
            repo_locks: Arc::new(DashMap::new()),
            provisioning: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn repos(&self) -> &RepoRepository {
        &self.repos
    }

    pub fn ingest(&self) -> &EventIngest {
        &self.ingest
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The session's exclusive lock. Held by callers that must observe and
    /// register against the event log without an ingest interleaving, e.g.
    /// the snapshot-then-subscribe pair.
    pub fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.lock_for(session_id)
    }

    fn repo_lock_for(&self, repo_id: &str) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(repo_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    /// Handle `session.start`: insert the row, record the start event and
    /// kick off asynchronous provisioning.
    pub async fn start_session(&self, req: StartSessionRequest) -> Result<Session, CommandError> {
        let repo = self
            .repos
            .get(&req.repo_id)
            .await?
            .ok_or_else(|| CommandError::RepoNotFound(req.repo_id.clone()))?;

        // Session creation is serialized per repository: the orchestrator
        // check and the insert below must not interleave with another
        // start for the same repo, or two orchestrators could both pass
        // the check.
        let repo_lock = self.repo_lock_for(&repo.id);
        let _repo_guard = repo_lock.lock().await;

        if req.role == SessionRole::Orchestrator
            && self
                .sessions
                .find_active_orchestrator(&repo.id)
                .await?
                .is_some()
        {
            return Err(CommandError::DuplicateOrchestrator);
        }

        let session_id = Uuid::new_v4().to_string();
        let branch = branch_label(&repo.name, &session_id);
        let base_branch = req
            .base_branch
            .clone()
            .unwrap_or_else(|| repo.default_branch.clone());
        let now = Self::now();
        let session = Session {
            id: session_id.clone(),
            repo_id: repo.id.clone(),
            role: req.role,
            status: SessionStatus::Starting,
            branch: branch.clone(),
            base_branch,
            worktree_path: None,
            container_id: None,
            created_at: now.clone(),
            updated_at: now,
            finished_at: None,
            last_event_id: None,
            head_rev: None,
            pr_url: None,
        };

        {
            let lock = self.lock_for(&session_id);
            let _guard = lock.lock().await;
            self.sessions.insert(&session).await?;
            self.ingest
                .record(
                    &session,
                    EventSource::Manager,
                    "session.started",
                    json!({
                        "role": session.role,
                        "branch": session.branch,
                        "baseBranch": session.base_branch,
                        "goalPrompt": req.goal_prompt,
                        "model": req.model,
                    }),
                )
                .await?;
        }

        info!(
            "Created session {} for {} on branch {}",
            session_id,
            repo.full_name(),
            branch
        );

        let cancel = CancellationToken::new();
        self.provisioning.insert(session_id.clone(), cancel.clone());
        let svc = self.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            svc.provision(task_session, repo, req.goal_prompt, req.model, cancel)
                .await;
        });

        Ok(session)
    }

    /// Provisioning pipeline. Runs outside the session lock; each step
    /// checks for cancellation so a racing `stop` unwinds cleanly.
    async fn provision(
        &self,
        session: Session,
        repo: Repo,
        goal: Option<String>,
        model: Option<String>,
        cancel: CancellationToken,
    ) {
        let mut worktree_created = false;
        let mut container_handle: Option<String> = None;

        let result = self
            .provision_steps(
                &session,
                &repo,
                goal,
                model,
                &cancel,
                &mut worktree_created,
                &mut container_handle,
            )
            .await;

        self.provisioning.remove(&session.id);

        match result {
            Ok(true) => {
                // All resources acquired; the sandbox announces itself with
                // a `process.started` event, which moves the session to
                // running.
            }
            Ok(false) => {
                info!(
                    "Provisioning for session {} cancelled, releasing partial resources",
                    session.id
                );
                self.release_partial(&session, &repo, worktree_created, container_handle.as_deref())
                    .await;
            }
            Err(e) => {
                error!("Provisioning failed for session {}: {:?}", session.id, e);
                self.release_partial(&session, &repo, worktree_created, container_handle.as_deref())
                    .await;

                let lock = self.lock_for(&session.id);
                let _guard = lock.lock().await;
                // A stop may have won the race; only fail non-terminal rows.
                match self.sessions.get(&session.id).await {
                    Ok(Some(current)) if !current.is_terminal() => {
                        let now = Self::now();
                        if let Err(err) = self
                            .sessions
                            .mark_terminal(&session.id, SessionStatus::Error, &now)
                            .await
                        {
                            error!("Failed to mark session {} errored: {:?}", session.id, err);
                        }
                        if let Err(err) = self
                            .ingest
                            .record(
                                &session,
                                EventSource::Manager,
                                "session.error",
                                json!({"phase": "provisioning", "message": e.to_string()}),
                            )
                            .await
                        {
                            error!(
                                "Failed to record provisioning failure for {}: {:?}",
                                session.id, err
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(err) => error!("Failed to reload session {}: {:?}", session.id, err),
                }
            }
        }
    }

    /// Returns Ok(true) when all steps completed, Ok(false) when cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn provision_steps(
        &self,
        session: &Session,
        repo: &Repo,
        goal: Option<String>,
        model: Option<String>,
        cancel: &CancellationToken,
        worktree_created: &mut bool,
        container_handle: &mut Option<String>,
    ) -> Result<bool> {
        let step_timeout = self.config.provision_step_timeout;

        if cancel.is_cancelled() {
            return Ok(false);
        }
        tokio::time::timeout(step_timeout, self.git.ensure_mirror(&repo.owner, &repo.name))
            .await
            .context("mirror step timed out")??;

        if cancel.is_cancelled() {
            return Ok(false);
        }
        let worktree = tokio::time::timeout(
            step_timeout,
            self.git.create_worktree(
                &repo.owner,
                &repo.name,
                &session.id,
                &session.base_branch,
                &session.branch,
            ),
        )
        .await
        .context("worktree step timed out")??;
        *worktree_created = true;
        self.sessions
            .set_worktree_path(
                &session.id,
                &worktree.path.display().to_string(),
                &Self::now(),
            )
            .await?;

        if cancel.is_cancelled() {
            return Ok(false);
        }
        let token = tokio::time::timeout(step_timeout, self.forge.get_access_token())
            .await
            .context("token step timed out")??;

        if cancel.is_cancelled() {
            return Ok(false);
        }
        let manager_url = format!("{}/ws", self.runtime.host_url(self.config.port))
            .replacen("http", "ws", 1);
        let sandbox = SandboxConfig {
            session_id: session.id.clone(),
            worktree_path: worktree.path.display().to_string(),
            token,
            manager_url,
            image: self.config.container_image.clone(),
            role: session.role,
            goal,
            model,
            base_system_prompt: self.config.base_system_prompt.clone(),
            idle_timeout_seconds: self.config.idle_timeout_seconds,
            extra_env: HashMap::new(),
        };
        let handle = tokio::time::timeout(step_timeout, self.runtime.start(&sandbox))
            .await
            .context("container step timed out")?
            .map_err(anyhow::Error::from)?;
        *container_handle = Some(handle.clone());
        self.sessions
            .set_container_id(&session.id, &handle, &Self::now())
            .await?;

        if cancel.is_cancelled() {
            return Ok(false);
        }
        Ok(true)
    }

    /// Release resources acquired by an unfinished provisioning run.
    async fn release_partial(
        &self,
        session: &Session,
        repo: &Repo,
        worktree_created: bool,
        container_handle: Option<&str>,
    ) {
        if let Some(handle) = container_handle {
            reap_container(self.runtime.as_ref(), handle).await;
            if let Err(e) = self
                .sessions
                .clear_container_id(&session.id, &Self::now())
                .await
            {
                warn!(
                    "Failed to clear container handle for {}: {:?}",
                    session.id, e
                );
            }
        }
        if worktree_created {
            if let Err(e) = self
                .git
                .remove_worktree(&repo.owner, &repo.name, &session.id)
                .await
            {
                warn!("Failed to remove worktree for {}: {:?}", session.id, e);
            }
        }
    }

    /// Handle `session.stop`. Idempotent: stopping a terminal session
    /// returns success without emitting a second stopped event.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), CommandError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| CommandError::SessionNotFound(session_id.to_string()))?;

        if session.is_terminal() {
            debug!(
                "Session {} already in terminal state {}",
                session_id, session.status
            );
            return Ok(());
        }

        // Cancel in-flight provisioning; the task releases its partial
        // resources at the next checkpoint.
        if let Some((_, cancel)) = self.provisioning.remove(session_id) {
            cancel.cancel();
        }

        // Ask the sandbox to wind down, if it is connected.
        if let Some(conn) = self.registry.sandbox_connection(session_id) {
            if let Ok(payload) = serde_json::to_value(SandboxCommand::Stop) {
                self.registry.send(
                    conn,
                    EnvelopeKind::Command,
                    Some(session_id.to_string()),
                    payload,
                );
            }
        }

        // Independently signal the container with a bounded grace period,
        // then force-remove.
        if let Some(ref handle) = session.container_id {
            if let Err(e) = self
                .runtime
                .stop(handle, Some(self.config.stop_grace_seconds))
                .await
            {
                warn!("Failed to stop container {}: {:?}", handle, e);
            }
            if let Err(e) = self.runtime.remove(handle, true).await {
                warn!("Failed to remove container {}: {:?}", handle, e);
            }
        }

        self.sessions
            .mark_terminal(session_id, SessionStatus::Stopped, &Self::now())
            .await?;
        self.ingest
            .record(&session, EventSource::Manager, "session.stopped", json!({}))
            .await?;

        // The worktree is retained for post-mortem inspection.
        info!("Session {} stopped", session_id);
        Ok(())
    }

    /// Handle `session.send_message`: move the session back to running,
    /// persist the message and forward it to the sandbox.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        force: bool,
    ) -> Result<(), CommandError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| CommandError::SessionNotFound(session_id.to_string()))?;

        match session.status {
            SessionStatus::Waiting => {}
            SessionStatus::Running if force => {}
            _ => return Err(CommandError::SessionNotWaiting),
        }

        let conn = self
            .registry
            .sandbox_connection(session_id)
            .ok_or(CommandError::NoContainer)?;

        if session.status == SessionStatus::Waiting {
            self.sessions
                .update_status(session_id, SessionStatus::Running, &Self::now())
                .await?;
        }

        self.ingest
            .record(
                &session,
                EventSource::Manager,
                "user.message",
                json!({"message": message}),
            )
            .await?;

        if let Ok(payload) = serde_json::to_value(SandboxCommand::UserMessage {
            message: message.to_string(),
        }) {
            self.registry.send(
                conn,
                EnvelopeKind::Command,
                Some(session_id.to_string()),
                payload,
            );
        }

        Ok(())
    }

    /// Ingest one inbound sandbox event and apply its lifecycle side
    /// effects. Returns the stored event for the ack.
    pub async fn ingest_from_sandbox(
        &self,
        session_id: &str,
        inbound: InboundEvent,
    ) -> Result<StoredEvent, CommandError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| CommandError::SessionNotFound(session_id.to_string()))?;

        let source = inbound.source();
        let kind = inbound.kind();
        let payload = inbound.payload();
        let stored = self
            .ingest
            .record(&session, source, &kind, payload)
            .await
            .map_err(CommandError::IngestFailed)?;

        if source == EventSource::Runner {
            match kind.as_str() {
                "process.started" => {
                    if session.status == SessionStatus::Starting {
                        self.sessions
                            .update_status(session_id, SessionStatus::Running, &Self::now())
                            .await?;
                        info!("Session {} is running", session_id);
                    }
                }
                // Duplicate idle events are suppressed: only a running
                // session moves to waiting.
                "session.idle" => {
                    if session.status == SessionStatus::Running {
                        self.sessions
                            .update_status(session_id, SessionStatus::Waiting, &Self::now())
                            .await?;
                        info!("Session {} is waiting for input", session_id);
                    }
                }
                _ => {}
            }
        }

        Ok(stored)
    }

    /// Sandbox transport loss. Clean `process.exited` beforehand means the
    /// run finished; anything else is an error.
    pub async fn handle_disconnect(&self, session_id: &str, reason: &str) {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = match self.sessions.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to load session {} on disconnect: {:?}", session_id, e);
                return;
            }
        };
        if session.is_terminal() {
            return;
        }

        let clean_exit = self.clean_exit_recorded(session_id).await;
        let status = if clean_exit {
            SessionStatus::Finished
        } else {
            SessionStatus::Error
        };

        if let Err(e) = self
            .sessions
            .mark_terminal(session_id, status, &Self::now())
            .await
        {
            error!("Failed to finish session {}: {:?}", session_id, e);
            return;
        }
        if let Err(e) = self
            .ingest
            .record(
                &session,
                EventSource::Manager,
                "container.disconnected",
                json!({"reason": reason}),
            )
            .await
        {
            error!(
                "Failed to record disconnect for session {}: {:?}",
                session_id, e
            );
        }

        if let Some(ref handle) = session.container_id {
            reap_container(self.runtime.as_ref(), handle).await;
        }

        if clean_exit {
            self.refresh_branch_caches(&session).await;
        }

        info!(
            "Session {} disconnected ({}) -> {}",
            session_id, reason, status
        );
    }

    async fn clean_exit_recorded(&self, session_id: &str) -> bool {
        let filter = EventFilter {
            kind: Some("process.exited".to_string()),
            source: Some(EventSource::Runner),
            limit: 1,
            order: EventOrder::Descending,
            ..Default::default()
        };
        match self.ingest.events().list_by_session(session_id, &filter).await {
            Ok(events) => events
                .first()
                .map(|e| e.payload.get("exitCode").and_then(|v| v.as_i64()) == Some(0))
                .unwrap_or(false),
            Err(e) => {
                warn!(
                    "Failed to check exit events for session {}: {:?}",
                    session_id, e
                );
                false
            }
        }
    }

    /// Best-effort refresh of the cached head revision and PR link.
    async fn refresh_branch_caches(&self, session: &Session) {
        let head_rev = match self.git.head_rev(&session.id).await {
            Ok(rev) => rev,
            Err(e) => {
                debug!("No head revision for session {}: {:?}", session.id, e);
                None
            }
        };

        let repo = match self.repos.get(&session.repo_id).await {
            Ok(Some(repo)) => repo,
            _ => return,
        };
        let pr_url = match self
            .forge
            .find_prs_for_branch(&repo.owner, &repo.name, &session.branch)
            .await
        {
            Ok(prs) => prs.into_iter().next().map(|pr| pr.html_url),
            Err(e) => {
                debug!("PR lookup failed for session {}: {:?}", session.id, e);
                None
            }
        };

        if let Err(e) = self
            .sessions
            .update_branch_caches(
                &session.id,
                head_rev.as_deref(),
                pr_url.as_deref(),
                &Self::now(),
            )
            .await
        {
            warn!(
                "Failed to update branch caches for session {}: {:?}",
                session.id, e
            );
        }
    }

    /// Crash recovery: the process just started, so no sandbox connection
    /// can be live. Every non-terminal session is orphaned and moves to
    /// error with a synthetic event. Stale worktrees are retained for
    /// debugging.
    pub async fn reconcile_on_startup(&self) -> Result<()> {
        let orphans = self.sessions.list_non_terminal().await?;
        for session in orphans {
            warn!(
                "Reconciling orphaned session {} found in state {}",
                session.id, session.status
            );
            self.sessions
                .mark_terminal(&session.id, SessionStatus::Error, &Self::now())
                .await?;
            if let Err(e) = self
                .ingest
                .record(
                    &session,
                    EventSource::Manager,
                    "container.disconnected",
                    json!({"reason": "manager_restart"}),
                )
                .await
            {
                error!(
                    "Failed to record reconcile event for session {}: {:?}",
                    session.id, e
                );
            }
            if let Some(ref handle) = session.container_id {
                reap_container(self.runtime.as_ref(), handle).await;
            }
        }
        Ok(())
    }
}
