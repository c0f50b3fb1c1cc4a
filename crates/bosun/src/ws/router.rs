//! Command router.
//!
//! Validates and dispatches observer commands, acking every one and
//! answering subscriptions with their corresponding snapshot.

use anyhow::Result;
use bosun_protocol::{
    codes, Ack, Command, Envelope, EnvelopeKind, ErrorBody, SnapshotTarget,
};
use log::{debug, warn};
use serde_json::{json, Value};

use crate::session::{CommandError, StartSessionRequest};
use crate::state::AppState;

use super::hub::{repo_topic, session_topic, REPO_LIST_TOPIC};
use super::registry::ConnectionId;

/// Dispatch one observer command envelope.
pub async fn handle_command(state: &AppState, conn: ConnectionId, envelope: &Envelope) {
    let command: Command = match serde_json::from_value(envelope.payload.clone()) {
        Ok(command) => command,
        Err(e) => {
            debug!("Connection {}: unknown command: {}", conn, e);
            send_error(
                state,
                conn,
                envelope,
                codes::UNKNOWN_COMMAND,
                format!("unrecognized command payload: {}", e),
            );
            return;
        }
    };

    let result = dispatch(state, conn, envelope, command).await;
    match result {
        Ok(data) => {
            let ack = match data {
                Some(data) => Ack::ok_with(envelope.seq, data),
                None => Ack::ok(envelope.seq),
            };
            if let Ok(payload) = serde_json::to_value(ack) {
                state.registry.send(
                    conn,
                    EnvelopeKind::Ack,
                    envelope.session_id.clone(),
                    payload,
                );
            }
        }
        Err(e) => {
            if matches!(e, CommandError::Internal(_)) {
                // Details stay in the log; the caller only learns the class.
                warn!("Connection {}: command failed internally: {:?}", conn, e);
                send_error(
                    state,
                    conn,
                    envelope,
                    codes::INTERNAL_ERROR,
                    "internal error".to_string(),
                );
            } else {
                send_error(state, conn, envelope, e.code(), e.to_string());
            }
        }
    }
}

async fn dispatch(
    state: &AppState,
    conn: ConnectionId,
    envelope: &Envelope,
    command: Command,
) -> Result<Option<Value>, CommandError> {
    match command {
        Command::SessionStart {
            repo_id,
            role,
            base_branch,
            goal_prompt,
            model,
        } => {
            let session = state
                .sessions
                .start_session(StartSessionRequest {
                    repo_id,
                    role,
                    base_branch,
                    goal_prompt,
                    model,
                })
                .await?;
            Ok(Some(json!({"sessionId": session.id, "session": session})))
        }

        Command::SessionStop { session_id } => {
            state.sessions.stop_session(&session_id).await?;
            Ok(None)
        }

        Command::SessionSendMessage {
            session_id,
            message,
            force,
        } => {
            state
                .sessions
                .send_message(&session_id, &message, force)
                .await?;
            Ok(None)
        }

        Command::SubscribeRepoList => {
            state.hub.subscribe(conn, REPO_LIST_TOPIC);
            send_snapshot(state, conn, None, repo_list_snapshot(state).await?);
            Ok(Some(json!({"subscriptionId": REPO_LIST_TOPIC})))
        }

        Command::SubscribeRepo { repo_id } => {
            let snapshot = repo_view_snapshot(state, &repo_id).await?;
            let topic = repo_topic(&repo_id);
            state.hub.subscribe(conn, &topic);
            send_snapshot(state, conn, None, snapshot);
            Ok(Some(json!({"subscriptionId": topic})))
        }

        Command::SubscribeSession { session_id } => {
            // Validate the session before registering the subscription.
            state
                .sessions
                .sessions()
                .get(&session_id)
                .await?
                .ok_or_else(|| CommandError::SessionNotFound(session_id.clone()))?;

            // Snapshot and subscription registration run under the session
            // lock so no ingest lands between them: the snapshot tail and
            // the live stream meet without overlap or gap.
            let topic = session_topic(&session_id);
            let snapshot = {
                let lock = state.sessions.session_lock(&session_id);
                let _guard = lock.lock().await;
                let snapshot = events_snapshot(state, &session_id, None, None).await?;
                state.hub.subscribe(conn, &topic);
                snapshot
            };
            send_snapshot(state, conn, Some(session_id), snapshot);
            Ok(Some(json!({"subscriptionId": topic})))
        }

        Command::Unsubscribe { subscription_id } => {
            state.hub.unsubscribe(conn, &subscription_id);
            Ok(None)
        }

        Command::SnapshotRequest {
            target,
            repo_id,
            session_id,
            after_event_id,
            limit,
        } => {
            let (session_id_for_envelope, snapshot) = match target {
                SnapshotTarget::Repos => (None, repo_list_snapshot(state).await?),
                SnapshotTarget::Sessions => {
                    let repo_id = repo_id.ok_or_else(|| {
                        CommandError::Invalid("snapshot target 'sessions' requires repoId".into())
                    })?;
                    (None, repo_view_snapshot(state, &repo_id).await?)
                }
                SnapshotTarget::Events => {
                    let session_id = session_id.ok_or_else(|| {
                        CommandError::Invalid("snapshot target 'events' requires sessionId".into())
                    })?;
                    let snapshot =
                        events_snapshot(state, &session_id, after_event_id, limit).await?;
                    (Some(session_id), snapshot)
                }
            };
            send_snapshot(state, conn, session_id_for_envelope, snapshot);
            Ok(None)
        }
    }
}

async fn repo_list_snapshot(state: &AppState) -> Result<Value, CommandError> {
    let repos = state.snapshots.repo_list().await?;
    Ok(json!({"target": "repos", "repos": repos}))
}

async fn repo_view_snapshot(state: &AppState, repo_id: &str) -> Result<Value, CommandError> {
    let view = state
        .snapshots
        .repo_view(repo_id)
        .await?
        .ok_or_else(|| CommandError::RepoNotFound(repo_id.to_string()))?;
    Ok(json!({
        "target": "sessions",
        "repo": view.repo,
        "sessions": view.sessions,
    }))
}

async fn events_snapshot(
    state: &AppState,
    session_id: &str,
    after: Option<i64>,
    limit: Option<u32>,
) -> Result<Value, CommandError> {
    let snapshot = state
        .snapshots
        .session_events(session_id, after, limit)
        .await?;
    let mut value = serde_json::to_value(snapshot).map_err(anyhow::Error::from)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("target".to_string(), json!("events"));
    }
    Ok(value)
}

fn send_snapshot(state: &AppState, conn: ConnectionId, session_id: Option<String>, payload: Value) {
    state
        .registry
        .send(conn, EnvelopeKind::Snapshot, session_id, payload);
}

fn send_error(
    state: &AppState,
    conn: ConnectionId,
    envelope: &Envelope,
    code: &str,
    message: String,
) {
    let mut body = ErrorBody::new(code, message);
    body.details = Some(json!({"commandSeq": envelope.seq}));
    if let Ok(payload) = serde_json::to_value(body) {
        state.registry.send(
            conn,
            EnvelopeKind::Error,
            envelope.session_id.clone(),
            payload,
        );
    }
}
