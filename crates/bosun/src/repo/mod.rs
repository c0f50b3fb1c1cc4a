//! Repository registration and metadata.

mod models;
mod repository;
mod service;

pub use models::Repo;
pub use repository::RepoRepository;
pub use service::RepoService;
