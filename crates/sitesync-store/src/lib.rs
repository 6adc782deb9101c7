//! The embedded transactional store (spec §4.1): one SQLite database file
//! holding runs, tasks, assets, asset versions, and exceptions. All state
//! transitions execute inside a single write transaction escalated with
//! `BEGIN IMMEDIATE`, so readers never observe partial lease reassignment.
//! No component outside this crate issues SQL against these tables.

mod assets;
mod exceptions;
mod retry;
mod runs;
mod tasks;

pub use assets::UpsertOutcome;
pub use retry::retry_on_busy;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;

/// Errors surfaced by the store that the Task Queue and Worker need to
/// match on (spec §7: `DuplicateTask`, `LeaseLost`), plus a catch-all for
/// everything else (`StoreUnavailable` once retries are exhausted).
#[derive(Debug)]
pub enum StoreError {
    /// `(run_id, url)` already has a task row. Benign; the caller swallows
    /// it (spec §7).
    DuplicateTask,
    /// The caller's lease no longer matches what's in the table — it
    /// expired or was reclaimed by another worker.
    LeaseLost,
    /// Retries against lock contention were exhausted, or some other
    /// database failure occurred.
    Unavailable(sqlx::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateTask => write!(f, "duplicate task"),
            StoreError::LeaseLost => write!(f, "lease lost"),
            StoreError::Unavailable(err) => write!(f, "store unavailable: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Unavailable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            StoreError::DuplicateTask
        } else {
            StoreError::Unavailable(err)
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the SQLite database at `path` and runs
    /// migrations. A single-connection pool is used deliberately: SQLite
    /// has exactly one writer at a time, and keeping that explicit avoids
    /// surprising cross-connection `SQLITE_BUSY` errors on anything but the
    /// write path itself.
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::connect_with(options).await
    }

    /// An in-memory store for tests. A single connection keeps the
    /// in-memory database alive and visible across `.await` points.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(event = "sitesync.store.migrated", "store schema up to date");

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
