//! Connection registry.
//!
//! Tracks every open bidirectional transport. A new connection is
//! `undetermined`; its first inbound envelope classifies it as a sandbox
//! (first `event`) or an observer (first `command`), and the classification
//! is permanent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bosun_protocol::{Envelope, EnvelopeKind, Sequencer};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque connection identifier.
pub type ConnectionId = u64;

/// Classification of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionClass {
    Undetermined,
    /// Owns exactly one session for its lifetime.
    Sandbox { session_id: String },
    Observer,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Envelope>,
    seq: Sequencer,
    cancel: CancellationToken,
    class: ConnectionClass,
    topics: HashSet<String>,
    last_inbound: Instant,
    pending_pings: u8,
}

/// Process-global registry of open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Connection>,
    /// session id -> the sandbox connection currently bound to it.
    sandbox_by_session: DashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new undetermined connection.
    pub fn register(
        &self,
        outbound: mpsc::UnboundedSender<Envelope>,
        cancel: CancellationToken,
    ) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(
            id,
            Connection {
                outbound,
                seq: Sequencer::new(),
                cancel,
                class: ConnectionClass::Undetermined,
                topics: HashSet::new(),
                last_inbound: Instant::now(),
                pending_pings: 0,
            },
        );
        debug!("Registered connection {}", id);
        id
    }

    /// Classify a connection as the sandbox for a session.
    ///
    /// If another sandbox connection is already bound to the session, the
    /// newer connection wins and the older one is closed (reconnection
    /// after a crash; the old transport is presumed stale). Returns an
    /// error if the connection was already classified differently.
    pub fn classify_sandbox(
        &self,
        id: ConnectionId,
        session_id: &str,
    ) -> Result<(), ClassifyError> {
        {
            let mut conn = self.connections.get_mut(&id).ok_or(ClassifyError::Gone)?;
            match &conn.class {
                ConnectionClass::Undetermined => {
                    conn.class = ConnectionClass::Sandbox {
                        session_id: session_id.to_string(),
                    };
                }
                ConnectionClass::Sandbox { session_id: bound } if bound == session_id => {
                    return Ok(());
                }
                other => {
                    return Err(ClassifyError::AlreadyClassified(other.clone()));
                }
            }
        }

        if let Some(previous) = self.sandbox_by_session.insert(session_id.to_string(), id) {
            if previous != id {
                warn!(
                    "Replacing stale sandbox connection {} for session {} with {}",
                    previous, session_id, id
                );
                self.close(previous);
            }
        }

        info!("Connection {} is the sandbox for session {}", id, session_id);
        Ok(())
    }

    /// Classify a connection as an observer.
    pub fn classify_observer(&self, id: ConnectionId) -> Result<(), ClassifyError> {
        let mut conn = self.connections.get_mut(&id).ok_or(ClassifyError::Gone)?;
        match &conn.class {
            ConnectionClass::Undetermined => {
                conn.class = ConnectionClass::Observer;
                info!("Connection {} is an observer", id);
                Ok(())
            }
            ConnectionClass::Observer => Ok(()),
            other => Err(ClassifyError::AlreadyClassified(other.clone())),
        }
    }

    /// Current classification of a connection.
    pub fn class_of(&self, id: ConnectionId) -> Option<ConnectionClass> {
        self.connections.get(&id).map(|c| c.class.clone())
    }

    /// The sandbox connection bound to a session, if one is live.
    pub fn sandbox_connection(&self, session_id: &str) -> Option<ConnectionId> {
        self.sandbox_by_session.get(session_id).map(|e| *e.value())
    }

    /// Build and enqueue an outbound envelope on a connection.
    ///
    /// The envelope is stamped with the connection's own monotone sequence
    /// number; the per-connection writer task keeps wire frames from
    /// interleaving. Returns false if the connection is gone.
    pub fn send(
        &self,
        id: ConnectionId,
        kind: EnvelopeKind,
        session_id: Option<String>,
        payload: Value,
    ) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        let envelope = Envelope::new(kind, session_id, conn.seq.next(), payload);
        if conn.outbound.send(envelope).is_err() {
            debug!("Dropping send to closed connection {}", id);
            return false;
        }
        true
    }

    /// Record inbound traffic: resets the heartbeat expectation.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.last_inbound = Instant::now();
            conn.pending_pings = 0;
        }
    }

    /// Sandbox connections quiet for at least `quiet`, with their current
    /// unreplied ping count.
    pub fn quiet_sandboxes(&self, quiet: Duration) -> Vec<(ConnectionId, u8)> {
        self.connections
            .iter()
            .filter(|entry| matches!(entry.class, ConnectionClass::Sandbox { .. }))
            .filter(|entry| entry.last_inbound.elapsed() >= quiet)
            .map(|entry| (*entry.key(), entry.pending_pings))
            .collect()
    }

    /// Count one more unreplied ping; returns the new count.
    pub fn mark_pinged(&self, id: ConnectionId) -> u8 {
        match self.connections.get_mut(&id) {
            Some(mut conn) => {
                conn.pending_pings = conn.pending_pings.saturating_add(1);
                conn.pending_pings
            }
            None => 0,
        }
    }

    /// Ask the connection's handler task to shut the transport down.
    pub fn close(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.get(&id) {
            conn.cancel.cancel();
        }
    }

    pub fn add_subscription(&self, id: ConnectionId, topic: &str) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.topics.insert(topic.to_string());
        }
    }

    pub fn remove_subscription(&self, id: ConnectionId, topic: &str) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.topics.remove(topic);
        }
    }

    /// Topic keys a connection is subscribed to.
    pub fn subscriptions_of(&self, id: ConnectionId) -> HashSet<String> {
        self.connections
            .get(&id)
            .map(|c| c.topics.clone())
            .unwrap_or_default()
    }

    /// Drop a connection. Returns its final classification and subscription
    /// set so the caller can finish cleanup (hub removal, session
    /// disconnect handling).
    pub fn forget(&self, id: ConnectionId) -> Option<(ConnectionClass, HashSet<String>)> {
        let (_, conn) = self.connections.remove(&id)?;
        if let ConnectionClass::Sandbox { ref session_id } = conn.class {
            // Only unbind if this connection still owns the session; a
            // replacement sandbox may already be bound.
            self.sandbox_by_session
                .remove_if(session_id, |_, bound| *bound == id);
        }
        debug!("Forgot connection {}", id);
        Some((conn.class, conn.topics))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Classification failures.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("connection is gone")]
    Gone,
    #[error("connection already classified as {0:?}")]
    AlreadyClassified(ConnectionClass),
}
