//! The per-session event log.

mod ingest;
mod models;
mod repository;

pub use ingest::EventIngest;
pub use models::{EventFilter, EventOrder, StoredEvent};
pub use repository::EventRepository;
