//! Transport layer: connection registry, subscription hub, WebSocket
//! handler and command router.

mod handler;
mod hub;
mod registry;
mod router;

pub use handler::ws_handler;
pub use hub::{repo_topic, session_topic, SubscriptionHub, REPO_LIST_TOPIC};
pub use registry::{ClassifyError, ConnectionClass, ConnectionId, ConnectionRegistry};
pub use router::handle_command;
