//! Session lifecycle: models, persistence and the controller.

mod models;
mod repository;
mod service;

pub use models::{branch_label, Session, SessionStatus};
pub use repository::SessionRepository;
pub use service::{CommandError, SessionService, SessionServiceConfig, StartSessionRequest};
