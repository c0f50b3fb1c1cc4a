//! Idle/health supervisor.
//!
//! The idle timer itself lives in the sandbox (it emits `session.idle`
//! runner events); the core's job here is the heartbeat expectation: a
//! sandbox connection quiet for a full interval is pinged with an ack-like
//! probe, and two consecutive unreplied pings close the connection, which
//! drives the disconnection path.

use bosun_protocol::EnvelopeKind;
use log::{debug, warn};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::state::AppState;

/// Spawn the heartbeat loop.
pub fn spawn_heartbeat(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.heartbeat_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            for (conn, pending) in state.registry.quiet_sandboxes(interval) {
                if pending >= 2 {
                    warn!(
                        "Sandbox connection {} missed {} pings, closing",
                        conn, pending
                    );
                    state.registry.close(conn);
                } else {
                    debug!("Pinging quiet sandbox connection {}", conn);
                    state
                        .registry
                        .send(conn, EnvelopeKind::Ack, None, json!({"ping": true}));
                    state.registry.mark_pinged(conn);
                }
            }
        }
    })
}
