//! Store plumbing shared by the daemon's storage layer.
//!
//! The store is a single `SQLite` file in WAL mode with foreign keys on.
//! Timestamps are stored as milliseconds since the Unix epoch everywhere:
//! message times, cursors, task schedules and run logs.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool size for file-backed stores.
const FILE_POOL_SIZE: u32 = 5;

/// Store failures. Outside tests every one of these is fatal to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Connection(e.to_string())
            }
            sqlx::Error::Io(io) => Self::Io(io.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Open the store file at `path`, creating it and its directory if needed.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Normal);
    let pool = connect(options, FILE_POOL_SIZE).await?;

    info!(path = %path.display(), "Store opened");
    Ok(pool)
}

/// A private in-memory store; lives as long as its single connection.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::new().in_memory(true);
    let pool = connect(options, 1).await?;
    debug!("In-memory store opened");
    Ok(pool)
}

async fn connect(
    options: SqliteConnectOptions,
    max_connections: u32,
) -> Result<Pool<Sqlite>, DatabaseError> {
    let options = options
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        // In-memory databases vanish with their last connection.
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Define a store handle type with `open`, `open_in_memory`, `pool` and
/// `close`, running the invoking crate's `./migrations` on open.
///
/// ```ignore
/// nestbox_core::define_database!(Database, "Store migrations applied");
/// ```
#[macro_export]
macro_rules! define_database {
    ($name:ident, $migration_msg:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::migrated($crate::db::open_pool(path).await?).await
            }

            /// Fresh, empty store for tests.
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::migrated($crate::db::open_pool_in_memory().await?).await
            }

            async fn migrated(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;
                ::tracing::debug!($migration_msg);
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }

            /// Close every pooled connection, waiting for in-flight queries.
            pub async fn close(&self) {
                self.pool.close().await;
            }
        }
    };
}
