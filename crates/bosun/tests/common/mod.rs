//! Test utilities and common setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bosun::config::Settings;
use bosun::container::{RuntimeHealth, SandboxConfig, SandboxInfo, SandboxRuntimeApi, SandboxResult};
use bosun::db::Database;
use bosun::forge::{AuthStatus, ForgeApi, ForgeRepo, ForgeUrls, PullRequest, RepoQuery, UrlOpts};
use bosun::git::{MirrorInfo, SourceControlApi, WorktreeInfo};
use bosun::repo::Repo;
use bosun::state::AppState;
use bosun::ws::ConnectionId;
use bosun_protocol::Envelope;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Source-control facade that records calls instead of shelling out.
#[derive(Default)]
pub struct MockGit {
    /// Artificial latency injected into `ensure_mirror`.
    pub mirror_delay: Option<Duration>,
    pub created_worktrees: Mutex<Vec<String>>,
    pub removed_worktrees: Mutex<Vec<String>>,
}

#[async_trait]
impl SourceControlApi for MockGit {
    async fn ensure_mirror(&self, _owner: &str, _name: &str) -> Result<MirrorInfo> {
        if let Some(delay) = self.mirror_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(MirrorInfo {
            default_branch: "main".to_string(),
        })
    }

    async fn create_worktree(
        &self,
        _owner: &str,
        _name: &str,
        session_id: &str,
        _base_branch: &str,
        _branch_name: &str,
    ) -> Result<WorktreeInfo> {
        self.created_worktrees
            .lock()
            .await
            .push(session_id.to_string());
        Ok(WorktreeInfo {
            path: PathBuf::from(format!("/tmp/bosun-test/worktrees/{}", session_id)),
        })
    }

    async fn remove_worktree(&self, _owner: &str, _name: &str, session_id: &str) -> Result<()> {
        self.removed_worktrees
            .lock()
            .await
            .push(session_id.to_string());
        Ok(())
    }

    async fn default_branch_of(&self, _owner: &str, _name: &str) -> Result<String> {
        Ok("main".to_string())
    }

    async fn head_rev(&self, _session_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Hosting-service facade backed by canned data.
#[derive(Default)]
pub struct MockForge {
    /// Artificial latency injected into `get_access_token`.
    pub token_delay: Option<Duration>,
}

#[async_trait]
impl ForgeApi for MockForge {
    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus {
            ok: true,
            user: Some("tester".to_string()),
            error: None,
        })
    }

    async fn get_access_token(&self) -> Result<String> {
        if let Some(delay) = self.token_delay {
            tokio::time::sleep(delay).await;
        }
        Ok("test-token".to_string())
    }

    async fn list_repos(&self, _query: &RepoQuery) -> Result<Vec<ForgeRepo>> {
        Ok(vec![])
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<ForgeRepo>> {
        Ok(Some(ForgeRepo {
            name: name.to_string(),
            full_name: format!("{}/{}", owner, name),
            default_branch: "main".to_string(),
            private: false,
        }))
    }

    async fn find_prs_for_branch(
        &self,
        _owner: &str,
        _name: &str,
        _branch: &str,
    ) -> Result<Vec<PullRequest>> {
        Ok(vec![])
    }

    async fn get_file(
        &self,
        _owner: &str,
        _name: &str,
        _path: &str,
        _reference: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    fn urls_for(&self, owner: &str, name: &str, _opts: &UrlOpts) -> ForgeUrls {
        ForgeUrls {
            repo: format!("https://example.test/{}/{}", owner, name),
            branch: None,
            compare: None,
            new_pr: None,
        }
    }
}

/// Container facade that records starts and stops.
#[derive(Default)]
pub struct MockSandbox {
    pub started: Mutex<Vec<SandboxConfig>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_start: bool,
}

#[async_trait]
impl SandboxRuntimeApi for MockSandbox {
    async fn check(&self) -> RuntimeHealth {
        RuntimeHealth {
            ok: true,
            version: Some("mock".to_string()),
            error: None,
        }
    }

    async fn start(&self, config: &SandboxConfig) -> SandboxResult<String> {
        if self.fail_start {
            return Err(bosun::container::SandboxError::RuntimeFailed {
                binary: "mock".to_string(),
                op: "run".to_string(),
                stderr: "mock start failure".to_string(),
            });
        }
        self.started.lock().await.push(config.clone());
        Ok(format!("container-{}", config.container_name()))
    }

    async fn stop(&self, handle: &str, _grace_seconds: Option<u32>) -> SandboxResult<()> {
        self.stopped.lock().await.push(handle.to_string());
        Ok(())
    }

    async fn remove(&self, handle: &str, _force: bool) -> SandboxResult<()> {
        self.removed.lock().await.push(handle.to_string());
        Ok(())
    }

    async fn info(&self, _handle: &str) -> SandboxResult<Option<SandboxInfo>> {
        Ok(None)
    }

    fn host_url(&self, port: u16) -> String {
        format!("http://localhost:{}", port)
    }
}

/// A fully wired control plane over an in-memory store and mock facades.
pub struct TestHarness {
    pub state: AppState,
    pub git: Arc<MockGit>,
    pub forge: Arc<MockForge>,
    pub runtime: Arc<MockSandbox>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_facades(MockGit::default(), MockForge::default(), MockSandbox::default()).await
    }

    pub async fn with_facades(git: MockGit, forge: MockForge, runtime: MockSandbox) -> Self {
        let db = Database::in_memory().await.expect("create test database");
        let git = Arc::new(git);
        let forge = Arc::new(forge);
        let runtime = Arc::new(runtime);

        let settings = Settings {
            database_url: PathBuf::from(":memory:"),
            workspace_root: PathBuf::from("/tmp/bosun-test"),
            ..Settings::default()
        };

        let state = AppState::new(
            db,
            git.clone(),
            forge.clone(),
            runtime.clone(),
            &settings,
        );

        Self {
            state,
            git,
            forge,
            runtime,
        }
    }

    /// Register the canonical test repository.
    pub async fn register_repo(&self) -> Repo {
        self.state
            .repos
            .register("acme", "webapp")
            .await
            .expect("register repo")
    }

    /// Register a transport connection classified as the session's sandbox.
    pub fn connect_sandbox(
        &self,
        session_id: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.state.registry.register(tx, CancellationToken::new());
        self.state
            .registry
            .classify_sandbox(id, session_id)
            .expect("classify sandbox");
        (id, rx)
    }

    /// Register a transport connection classified as an observer.
    pub fn connect_observer(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.state.registry.register(tx, CancellationToken::new());
        self.state
            .registry
            .classify_observer(id)
            .expect("classify observer");
        (id, rx)
    }
}

/// Poll a condition until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
