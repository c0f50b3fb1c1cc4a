//! Snapshot service integration tests.

use bosun::session::{SessionStatus, StartSessionRequest};
use bosun_protocol::{EventSource, SessionRole};
use serde_json::json;

mod common;
use common::{wait_until, TestHarness};

async fn started_session(harness: &TestHarness, repo_id: &str) -> String {
    let session = harness
        .state
        .sessions
        .start_session(StartSessionRequest {
            repo_id: repo_id.to_string(),
            role: SessionRole::Implementer,
            base_branch: Some("main".to_string()),
            goal_prompt: None,
            model: None,
        })
        .await
        .unwrap();
    let id = session.id.clone();
    let session_id: &str = &id;
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
    assert!(provisioned);
    id
}

#[tokio::test]
async fn repo_list_carries_derived_counts() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session_id = started_session(&harness, &repo.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session_id);
    harness
        .state
        .sessions
        .ingest_from_sandbox(
            &session_id,
            bosun_protocol::InboundEvent::RunnerEvent(bosun_protocol::RunnerEvent {
                kind: "process.started".to_string(),
                data: None,
            }),
        )
        .await
        .unwrap();

    let repos = harness.state.snapshots.repo_list().await.unwrap();
    assert_eq!(repos.len(), 1);
    let summary = &repos[0];
    assert_eq!(summary.repo.id, repo.id);
    assert_eq!(summary.total_sessions, 1);
    assert_eq!(summary.active_sessions, 1);
    assert!(summary.has_running);
    assert!(!summary.has_waiting);
    assert!(!summary.has_error);
    assert!(summary.repo.last_activity_at.is_some());
}

#[tokio::test]
async fn repo_view_flags_sessions_needing_input() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session_id = started_session(&harness, &repo.id).await;

    let (_conn, _rx) = harness.connect_sandbox(&session_id);
    for kind in ["process.started", "session.idle"] {
        harness
            .state
            .sessions
            .ingest_from_sandbox(
                &session_id,
                bosun_protocol::InboundEvent::RunnerEvent(bosun_protocol::RunnerEvent {
                    kind: kind.to_string(),
                    data: None,
                }),
            )
            .await
            .unwrap();
    }

    let view = harness
        .state
        .snapshots
        .repo_view(&repo.id)
        .await
        .unwrap()
        .expect("repo exists");
    assert_eq!(view.sessions.len(), 1);
    assert_eq!(view.sessions[0].session.status, SessionStatus::Waiting);
    assert!(view.sessions[0].needs_input);
}

#[tokio::test]
async fn event_tail_and_cursor_have_no_overlap_and_no_gap() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session_id = started_session(&harness, &repo.id).await;
    let session = harness
        .state
        .sessions
        .sessions()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();

    let ingest = harness.state.sessions.ingest();
    for i in 0..5 {
        ingest
            .record(
                &session,
                EventSource::Runner,
                "agent.progress",
                json!({"step": i}),
            )
            .await
            .unwrap();
    }

    let first = harness
        .state
        .snapshots
        .session_events(&session_id, None, None)
        .await
        .unwrap();
    let cursor = first.cursor.expect("cursor for non-empty tail");
    assert!(!first.has_more);

    // Ids are strictly increasing within the page.
    let ids: Vec<i64> = first.events.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted);

    // More events land after the snapshot.
    for i in 5..8 {
        ingest
            .record(
                &session,
                EventSource::Runner,
                "agent.progress",
                json!({"step": i}),
            )
            .await
            .unwrap();
    }

    let second = harness
        .state
        .snapshots
        .session_events(&session_id, Some(cursor), None)
        .await
        .unwrap();

    // No overlap with the first page, no gap against the cursor.
    assert_eq!(second.events.len(), 3);
    assert!(second.events.iter().all(|e| e.id > cursor));
    assert_eq!(second.events.first().map(|e| e.id), Some(cursor + 1));
    assert!(!second.has_more);
}

#[tokio::test]
async fn event_pagination_clamps_and_reports_more() {
    let harness = TestHarness::new().await;
    let repo = harness.register_repo().await;
    let session_id = started_session(&harness, &repo.id).await;
    let session = harness
        .state
        .sessions
        .sessions()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();

    let ingest = harness.state.sessions.ingest();
    for i in 0..15 {
        ingest
            .record(
                &session,
                EventSource::Claude,
                "assistant",
                json!({"text": format!("chunk {}", i)}),
            )
            .await
            .unwrap();
    }

    let page = harness
        .state
        .snapshots
        .session_events(&session_id, None, Some(10))
        .await
        .unwrap();
    assert_eq!(page.events.len(), 10);
    assert!(page.has_more);

    // The tail is the most recent ten, chronological.
    let last = page.events.last().unwrap();
    assert_eq!(last.payload, json!({"text": "chunk 14"}));

    // Walk forward from the cursor: the remainder arrives without overlap.
    let rest = harness
        .state
        .snapshots
        .session_events(&session_id, Some(page.cursor.unwrap()), Some(10))
        .await
        .unwrap();
    assert!(rest.events.is_empty());
    assert!(!rest.has_more);
}
