//! The durable store.
//!
//! One SQLite file holds the three tables (repos, sessions, events). Two
//! properties of the schema matter to the rest of the crate: event ids come
//! from an AUTOINCREMENT column, which is what makes them monotone across
//! the whole log, and repo deletion cascades through sessions to events,
//! which needs `PRAGMA foreign_keys` switched on for every connection.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Writers are serialized per session by the controller, so contention on
/// the store is low; a handful of connections covers ingest plus snapshot
/// readers.
const POOL_SIZE: u32 = 5;

/// How long a connection may sit on SQLite's write lock before the ingest
/// transaction is failed (and surfaced as `INGEST_FAILED`).
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(30);

/// Handle to the SQLite pool, with the schema applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the store at `path`, creating the file, its parent directory
    /// and the schema as needed. WAL mode keeps snapshot reads from
    /// blocking behind the ingest transaction.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .context("parsing store path")?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(WRITE_STALL_LIMIT);

        Self::connect(options, POOL_SIZE).await
    }

    /// An in-memory store for tests. Capped at one connection: every
    /// in-memory connection is its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory store url")?
            .foreign_keys(true);

        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, pool_size: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await
            .context("opening store")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("applying schema migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
