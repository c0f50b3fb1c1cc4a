//! Canonical wire types for bosun transports.
//!
//! Every message exchanged between the control plane, sandboxes and
//! observers is a single [`Envelope`]. The payload shapes for each
//! envelope kind live in [`commands`] and [`events`].

mod envelope;

pub mod codes;
pub mod commands;
pub mod events;

pub use envelope::{Envelope, EnvelopeKind, ProtocolError, Sequencer, PROTOCOL_VERSION};

pub use commands::{Command, SandboxCommand, SnapshotTarget};
pub use events::{Ack, ErrorBody, EventSource, InboundEvent, RunnerEvent, SessionRole, WireEvent};
