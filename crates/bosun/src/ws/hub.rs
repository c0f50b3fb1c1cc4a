//! Subscription hub: topic-keyed fan-out to observer connections.
//!
//! Every topic owns a single queue drained by one task. Publications and
//! membership changes travel through the same queue, so all subscribers of
//! a topic see the same sequence of publications in publish order, and a
//! new subscriber never receives a publication enqueued before its
//! subscription. Delivery into a connection's outbound queue is
//! best-effort; observers that fall behind reconcile with a snapshot on
//! reconnect.

use std::collections::HashSet;
use std::sync::Arc;

use bosun_protocol::EnvelopeKind;
use dashmap::DashMap;
use log::{debug, info};
use serde_json::Value;
use tokio::sync::mpsc;

use super::registry::{ConnectionId, ConnectionRegistry};

/// Topic key for the repository list.
pub const REPO_LIST_TOPIC: &str = "repo_list";

/// Topic key for one repository.
pub fn repo_topic(repo_id: &str) -> String {
    format!("repo:{}", repo_id)
}

/// Topic key for one session.
pub fn session_topic(session_id: &str) -> String {
    format!("session:{}", session_id)
}

struct Publication {
    kind: EnvelopeKind,
    session_id: Option<String>,
    payload: Value,
}

enum TopicCommand {
    Publish(Publication),
    Subscribe(ConnectionId),
    Unsubscribe(ConnectionId),
}

struct TopicState {
    tx: mpsc::UnboundedSender<TopicCommand>,
    /// Mirror of the drain task's membership, for queries and cleanup. The
    /// drain task's own set is authoritative for delivery.
    subscribers: HashSet<ConnectionId>,
}

/// Maps topic keys to subscribed observer connections and fans published
/// envelopes out to them in emit order.
pub struct SubscriptionHub {
    registry: Arc<ConnectionRegistry>,
    topics: Arc<DashMap<String, TopicState>>,
}

impl SubscriptionHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            topics: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe a connection to a topic. Publications enqueued before this
    /// call are not delivered to the connection.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) {
        self.ensure_topic(topic);
        if let Some(mut state) = self.topics.get_mut(topic) {
            state.subscribers.insert(id);
            let _ = state.tx.send(TopicCommand::Subscribe(id));
        }
        self.registry.add_subscription(id, topic);
        info!("Connection {} subscribed to {}", id, topic);
    }

    /// Drop one subscription.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            state.subscribers.remove(&id);
            let _ = state.tx.send(TopicCommand::Unsubscribe(id));
        }
        self.registry.remove_subscription(id, topic);
        info!("Connection {} unsubscribed from {}", id, topic);
    }

    /// Publish to a topic. Subscribers receive the payload wrapped in their
    /// own connection envelope, in publish order.
    pub fn publish(
        &self,
        topic: &str,
        kind: EnvelopeKind,
        session_id: Option<String>,
        payload: Value,
    ) {
        self.ensure_topic(topic);
        if let Some(state) = self.topics.get(topic) {
            let _ = state.tx.send(TopicCommand::Publish(Publication {
                kind,
                session_id,
                payload,
            }));
        }
    }

    /// Remove a forgotten connection from every topic it subscribed to.
    pub fn forget_connection(&self, id: ConnectionId, topics: &HashSet<String>) {
        for topic in topics {
            if let Some(mut state) = self.topics.get_mut(topic) {
                state.subscribers.remove(&id);
                let _ = state.tx.send(TopicCommand::Unsubscribe(id));
            }
        }
    }

    /// Whether a connection is subscribed to a topic.
    pub fn is_subscribed(&self, id: ConnectionId, topic: &str) -> bool {
        self.topics
            .get(topic)
            .map(|state| state.subscribers.contains(&id))
            .unwrap_or(false)
    }

    fn ensure_topic(&self, topic: &str) {
        if self.topics.contains_key(topic) {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<TopicCommand>();
        let inserted = {
            use dashmap::mapref::entry::Entry;
            match self.topics.entry(topic.to_string()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(vacant) => {
                    vacant.insert(TopicState {
                        tx,
                        subscribers: HashSet::new(),
                    });
                    true
                }
            }
        };
        if !inserted {
            return;
        }

        let registry = self.registry.clone();
        let name = topic.to_string();
        tokio::spawn(async move {
            let mut members: HashSet<ConnectionId> = HashSet::new();
            while let Some(command) = rx.recv().await {
                match command {
                    TopicCommand::Subscribe(id) => {
                        members.insert(id);
                    }
                    TopicCommand::Unsubscribe(id) => {
                        members.remove(&id);
                    }
                    TopicCommand::Publish(publication) => {
                        for id in &members {
                            if !registry.send(
                                *id,
                                publication.kind,
                                publication.session_id.clone(),
                                publication.payload.clone(),
                            ) {
                                debug!("Failed to deliver {} publication to {}", name, id);
                            }
                        }
                    }
                }
            }
        });
    }
}
