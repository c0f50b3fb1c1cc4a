//! Session lifecycle integration tests.

use std::time::Duration;

use bosun::session::{CommandError, SessionStatus, StartSessionRequest};
use bosun_protocol::{EventSource, InboundEvent, RunnerEvent, SessionRole};
use serde_json::json;

mod common;
use common::{wait_until, MockForge, MockGit, MockSandbox, TestHarness};

fn start_request(repo_id: &str, role: SessionRole) -> StartSessionRequest {
    StartSessionRequest {
        repo_id: repo_id.to_string(),
        role,
        base_branch: Some("main".to_string()),
        goal_prompt: Some("Fix the bug".to_string()),
        model: None,
    }
}

fn runner_event(kind: &str, data: serde_json::Value) -> InboundEvent {
    InboundEvent::RunnerEvent(RunnerEvent {
        kind: kind.to_string(),
        data: Some(data),
    })
}

/// Wait until provisioning recorded a container handle for the session.
async fn wait_provisioned(harness: &TestHarness, session_id: &str) {
    let provisioned = wait_until(|| async move {
        harness
            .state
            .sessions
            .sessions()
            .get(session_id)
            .await
            .unwrap()
            .map(|s| s.container_id.is_some())
            .unwrap_or(false)
    })
    .await;
    assert!(provisioned, "provisioning did not complete in time");
}

#[tokio::test]
async fn happy_path_start_run_idle() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;

    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Starting);
    let expected_branch = format!("agent/webapp/{}", &session.id[..8]);
    assert_eq!(session.branch, expected_branch);

    wait_provisioned(&harness, &session.id).await;
    assert_eq!(harness.runtime.started.lock().await.len(), 1);

    // The sandbox connects and announces itself.
    let (_conn, _rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Running);

    // Thirty quiet seconds later the sandbox reports idle.
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("session.idle", json!({})))
        .await
        .unwrap();

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Waiting);
    assert!(current.last_event_id.is_some());

    // The log holds the manager start event and the runner process event.
    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    let kinds: Vec<(EventSource, String)> = snapshot
        .events
        .iter()
        .map(|e| (e.source, e.kind.clone()))
        .collect();
    assert!(kinds.contains(&(EventSource::Manager, "session.started".to_string())));
    assert!(kinds.contains(&(EventSource::Runner, "process.started".to_string())));
}

#[tokio::test]
async fn user_message_moves_waiting_to_running() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    let (_conn, mut sandbox_rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("session.idle", json!({})))
        .await
        .unwrap();

    harness
        .state
        .sessions
        .send_message(&session.id, "continue", false)
        .await
        .unwrap();

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Running);

    // The message is in the log with manager source.
    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    let message_event = snapshot
        .events
        .iter()
        .find(|e| e.kind == "user.message")
        .expect("user.message event persisted");
    assert_eq!(message_event.source, EventSource::Manager);
    assert_eq!(message_event.payload, json!({"message": "continue"}));

    // And the sandbox received a user_message command envelope.
    let forwarded = sandbox_rx.recv().await.expect("forwarded command");
    assert_eq!(forwarded.payload["type"], "user_message");
    assert_eq!(forwarded.payload["message"], "continue");
}

#[tokio::test]
async fn send_message_rejected_while_running_unless_forced() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();

    let err = harness
        .state
        .sessions
        .send_message(&session.id, "nudge", false)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::SessionNotWaiting));
    assert_eq!(err.code(), "SESSION_NOT_WAITING");

    // No state change, no event persisted.
    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    assert!(!snapshot.events.iter().any(|e| e.kind == "user.message"));

    // The force flag lets the nudge through.
    harness
        .state
        .sessions
        .send_message(&session.id, "nudge", true)
        .await
        .unwrap();
    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Running);
}

#[tokio::test]
async fn sandbox_crash_drives_session_to_error() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();

    // An observer watches the session topic.
    let (observer, mut observer_rx) = harness.connect_observer();
    harness
        .state
        .hub
        .subscribe(observer, &bosun::ws::session_topic(&session.id));

    // The transport dies without a process.exited event.
    harness
        .state
        .sessions
        .handle_disconnect(&session.id, "connection_lost")
        .await;

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Error);
    assert!(current.finished_at.is_some());

    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    let disconnect = snapshot
        .events
        .iter()
        .find(|e| e.kind == "container.disconnected")
        .expect("disconnect event persisted");
    assert_eq!(disconnect.source, EventSource::Manager);
    assert_eq!(disconnect.payload, json!({"reason": "connection_lost"}));

    // The subscriber saw the broadcast.
    let mut received = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_millis(200), observer_rx.recv()).await {
            Ok(Some(env)) if env.payload["type"] == "container.disconnected" => {
                received = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(received, "observer never saw the disconnect broadcast");
}

#[tokio::test]
async fn clean_exit_disconnect_finishes_session() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();
    harness
        .state
        .sessions
        .ingest_from_sandbox(
            &session.id,
            runner_event("process.exited", json!({"exitCode": 0})),
        )
        .await
        .unwrap();

    harness
        .state
        .sessions
        .handle_disconnect(&session.id, "connection_closed")
        .await;

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Finished);
    assert!(current.finished_at.is_some());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    harness.state.sessions.stop_session(&session.id).await.unwrap();
    harness.state.sessions.stop_session(&session.id).await.unwrap();

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Stopped);
    assert!(current.finished_at.is_some());

    // Exactly one stopped event despite two stop commands.
    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    let stopped_events = snapshot
        .events
        .iter()
        .filter(|e| e.kind == "session.stopped")
        .count();
    assert_eq!(stopped_events, 1);

    // The container was signalled and removed; the worktree is retained.
    assert_eq!(harness.runtime.stopped.lock().await.len(), 1);
    assert!(harness.git.removed_worktrees.lock().await.is_empty());
}

#[tokio::test]
async fn duplicate_idle_events_are_suppressed() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();

    for _ in 0..3 {
        harness
            .state
            .sessions
            .ingest_from_sandbox(&session.id, runner_event("session.idle", json!({})))
            .await
            .unwrap();
    }

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn stop_during_provisioning_cancels_and_unwinds() {
    // The mirror step hangs long enough for the stop to land first.
    let harness = TestHarness::with_facades(
        MockGit {
            mirror_delay: Some(Duration::from_millis(200)),
            ..MockGit::default()
        },
        MockForge::default(),
        MockSandbox::default(),
    )
    .await;
    let repo = harness.register_repo().await;

    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.state.sessions.stop_session(&session.id).await.unwrap();

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Stopped);
    assert!(current.finished_at.is_some());

    // Let the provisioning task hit its cancellation checkpoint.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The container was never started and the status stayed stopped.
    assert!(harness.runtime.started.lock().await.is_empty());
    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Stopped);

    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    let stopped_events = snapshot
        .events
        .iter()
        .filter(|e| e.kind == "session.stopped")
        .count();
    assert_eq!(stopped_events, 1);
}

#[tokio::test]
async fn stop_after_worktree_step_releases_it() {
    // The token step hangs; the worktree exists by the time stop lands.
    let harness = TestHarness::with_facades(
        MockGit::default(),
        MockForge {
            token_delay: Some(Duration::from_millis(200)),
        },
        MockSandbox::default(),
    )
    .await;
    let repo = harness.register_repo().await;

    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();

    let worktree_ready = wait_until(|| {
        let git = harness.git.clone();
        async move { !git.created_worktrees.lock().await.is_empty() }
    })
    .await;
    assert!(worktree_ready);

    harness.state.sessions.stop_session(&session.id).await.unwrap();

    let released = wait_until(|| {
        let git = harness.git.clone();
        let session_id = session.id.clone();
        async move { git.removed_worktrees.lock().await.contains(&session_id) }
    })
    .await;
    assert!(released, "partial worktree was not released");
    assert!(harness.runtime.started.lock().await.is_empty());
}

#[tokio::test]
async fn provisioning_failure_drives_session_to_error() {
    let harness = TestHarness::with_facades(
        MockGit::default(),
        MockForge::default(),
        MockSandbox {
            fail_start: true,
            ..MockSandbox::default()
        },
    )
    .await;
    let repo = harness.register_repo().await;

    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();

    let errored = wait_until(|| {
        let sessions = harness.state.sessions.clone();
        let session_id = session.id.clone();
        async move {
            sessions
                .sessions()
                .get(&session_id)
                .await
                .unwrap()
                .map(|s| s.status == SessionStatus::Error)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(errored, "session never reached error state");

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert!(current.finished_at.is_some());

    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    assert!(snapshot.events.iter().any(|e| e.kind == "session.error"));

    // The acquired worktree was reaped.
    assert!(harness
        .git
        .removed_worktrees
        .lock()
        .await
        .contains(&session.id));
}

#[tokio::test]
async fn at_most_one_orchestrator_per_repo() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;

    harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Orchestrator))
        .await
        .unwrap();

    let err = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Orchestrator))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::DuplicateOrchestrator));
    assert_eq!(err.code(), "DUPLICATE_ORCHESTRATOR");

    // Implementers are not limited.
    harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_orchestrator_starts_admit_exactly_one() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;

    let first = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Orchestrator));
    let second = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Orchestrator));

    let (a, b) = tokio::join!(first, second);
    let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1, "exactly one orchestrator may be admitted");

    let rejected = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(rejected, CommandError::DuplicateOrchestrator));
}

#[tokio::test]
async fn startup_reconciliation_errors_orphans() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session = harness
        .state
        .sessions
        .start_session(start_request(&repo.id, SessionRole::Implementer))
        .await
        .unwrap();
    wait_provisioned(&harness, &session.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session.id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(&session.id, runner_event("process.started", json!({})))
        .await
        .unwrap();

    // Simulate a restart: no live connections, non-terminal row in the
    // store.
    harness.state.sessions.reconcile_on_startup().await.unwrap();

    let current = harness
        .state
        .sessions
        .sessions()
        .get(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SessionStatus::Error);
    assert!(current.finished_at.is_some());

    let snapshot = harness
        .state
        .snapshots
        .session_events(&session.id, None, None)
        .await
        .unwrap();
    let reconcile = snapshot
        .events
        .iter()
        .find(|e| e.kind == "container.disconnected")
        .expect("reconcile event persisted");
    assert_eq!(reconcile.payload, json!({"reason": "manager_restart"}));
}

#[tokio::test]
async fn unknown_repo_is_rejected() {
    let harness = TestHarness::new().await;
    let err = harness
        .state
        .sessions
        .start_session(start_request("missing", SessionRole::Implementer))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::RepoNotFound(_)));
    assert_eq!(err.code(), "REPO_NOT_FOUND");
}
