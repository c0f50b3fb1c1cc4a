//! WebSocket endpoint.
//!
//! One handler serves both sandboxes and observers; the first inbound
//! envelope classifies the connection. Outbound envelopes flow through a
//! per-connection writer task so wire frames never interleave.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bosun_protocol::{codes, Ack, Envelope, EnvelopeKind, ErrorBody, InboundEvent};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

use super::registry::{ConnectionClass, ConnectionId};
use super::router;

/// WebSocket endpoint for sandboxes and observers.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let cancel = CancellationToken::new();
    let conn_id = state.registry.register(outbound_tx, cancel.clone());

    info!("Connection {} established", conn_id);

    // Writer task: drains the outbound queue onto the wire in order.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if ws_sender
                .send(Message::Text(envelope.encode().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.registry.touch(conn_id);
                        match Envelope::decode(&text) {
                            Ok(envelope) => route_envelope(&state, conn_id, envelope).await,
                            Err(e) => {
                                debug!("Connection {}: invalid envelope: {}", conn_id, e);
                                send_error(&state, conn_id, None, codes::INVALID_MESSAGE, e.to_string());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        state.registry.touch(conn_id);
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!("Connection {} transport error: {}", conn_id, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    writer.abort();

    if let Some((class, topics)) = state.registry.forget(conn_id) {
        state.hub.forget_connection(conn_id, &topics);
        if let ConnectionClass::Sandbox { session_id } = class {
            // A replacement sandbox may already own the session; only the
            // last connection standing drives the disconnect path.
            if state.registry.sandbox_connection(&session_id).is_none() {
                state
                    .sessions
                    .handle_disconnect(&session_id, "connection_lost")
                    .await;
            }
        }
    }

    info!("Connection {} closed", conn_id);
}

async fn route_envelope(state: &AppState, conn: ConnectionId, envelope: Envelope) {
    match envelope.kind {
        EnvelopeKind::Event => {
            let Some(session_id) = envelope.session_id.clone() else {
                send_error(
                    state,
                    conn,
                    None,
                    codes::INVALID_MESSAGE,
                    "event envelope requires a session id".to_string(),
                );
                return;
            };

            // The first inbound event binds this connection as the
            // session's sandbox.
            if let Err(e) = state.registry.classify_sandbox(conn, &session_id) {
                send_error(
                    state,
                    conn,
                    Some(session_id),
                    codes::INVALID_MESSAGE,
                    e.to_string(),
                );
                return;
            }

            let inbound: InboundEvent = match serde_json::from_value(envelope.payload.clone()) {
                Ok(inbound) => inbound,
                Err(e) => {
                    send_error(
                        state,
                        conn,
                        Some(session_id),
                        codes::INVALID_MESSAGE,
                        format!("unrecognized event payload: {}", e),
                    );
                    return;
                }
            };

            match state.sessions.ingest_from_sandbox(&session_id, inbound).await {
                Ok(stored) => {
                    if let Ok(payload) =
                        serde_json::to_value(Ack::ok_with(envelope.seq, json!({"eventId": stored.id})))
                    {
                        state
                            .registry
                            .send(conn, EnvelopeKind::Ack, Some(session_id), payload);
                    }
                }
                Err(e) => {
                    warn!(
                        "Connection {}: ingest failed for session {}: {:?}",
                        conn, session_id, e
                    );
                    send_error(state, conn, Some(session_id), e.code(), e.to_string());
                }
            }
        }

        EnvelopeKind::Command => {
            match state.registry.class_of(conn) {
                Some(ConnectionClass::Undetermined) => {
                    // The first inbound command classifies an observer.
                    if let Err(e) = state.registry.classify_observer(conn) {
                        send_error(
                            state,
                            conn,
                            envelope.session_id.clone(),
                            codes::INVALID_MESSAGE,
                            e.to_string(),
                        );
                        return;
                    }
                }
                Some(ConnectionClass::Observer) => {}
                _ => {
                    send_error(
                        state,
                        conn,
                        envelope.session_id.clone(),
                        codes::UNKNOWN_COMMAND,
                        "sandbox connections cannot issue observer commands".to_string(),
                    );
                    return;
                }
            }
            router::handle_command(state, conn, &envelope).await;
        }

        // Heartbeat replies and client-side acks; inbound traffic already
        // reset the quiet timer.
        EnvelopeKind::Ack => {}

        other => {
            send_error(
                state,
                conn,
                envelope.session_id.clone(),
                codes::UNKNOWN_KIND,
                format!("unexpected inbound envelope kind: {}", other),
            );
        }
    }
}

fn send_error(
    state: &AppState,
    conn: ConnectionId,
    session_id: Option<String>,
    code: &str,
    message: String,
) {
    if let Ok(payload) = serde_json::to_value(ErrorBody::new(code, message)) {
        state
            .registry
            .send(conn, EnvelopeKind::Error, session_id, payload);
    }
}
