//! Contains the SQLite [`Datastore`]: connection handling, schema
//! bootstrap and the recorder constructors.
//!
//! SQLite is a file-locked single-writer store: the datastore holds a
//! one-connection writer pool (so insert transactions serialize
//! intrinsically, which is what makes commit order equal notification-id
//! order) and, for on-disk databases in WAL mode, a separate read-only
//! pool serving concurrent selects.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use chronicle::env::{EnvError, Environment, CREATE_TABLE};
use chronicle::recorder::{InsertError, IntegrityError, PersistenceError};

use crate::{aggregate, application, process, tracking};

/// Environment key holding the database file path, or `:memory:`.
pub const SQLITE_DBNAME: &str = "SQLITE_DBNAME";

/// Environment key holding the write-lock timeout in seconds.
pub const SQLITE_LOCK_TIMEOUT: &str = "SQLITE_LOCK_TIMEOUT";

/// The special database name selecting a transient in-memory database.
pub const MEMORY_DB: &str = ":memory:";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_POOL_SIZE: u32 = 5;

/// Connection settings for a SQLite [`Datastore`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database file path, or [`MEMORY_DB`].
    pub dbname: String,

    /// Bound on acquiring the database write lock (`busy_timeout`).
    pub lock_timeout: Duration,

    /// Size of the read-only pool used for selects on on-disk
    /// databases. In-memory databases share the writer connection.
    pub pool_size: u32,

    /// Whether recorder constructors run idempotent schema DDL.
    /// Disable when tables are externally managed.
    pub create_tables: bool,
}

impl Settings {
    /// Returns settings for the given database file path.
    pub fn new(dbname: impl Into<String>) -> Self {
        Self {
            dbname: dbname.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            pool_size: DEFAULT_READ_POOL_SIZE,
            create_tables: true,
        }
    }

    /// Returns settings for a transient in-memory database.
    pub fn in_memory() -> Self {
        Self::new(MEMORY_DB)
    }

    /// Reads settings from `SQLITE_DBNAME`, `SQLITE_LOCK_TIMEOUT` and
    /// `CREATE_TABLE`.
    pub fn from_env(env: &Environment) -> Result<Self, EnvError> {
        let dbname = env.get(SQLITE_DBNAME).ok_or_else(|| EnvError::Missing {
            key: SQLITE_DBNAME.to_owned(),
        })?;

        let mut settings = Self::new(dbname);

        if let Some(value) = env.get(SQLITE_LOCK_TIMEOUT) {
            let seconds: u64 = value.parse().map_err(|_| EnvError::Invalid {
                key: SQLITE_LOCK_TIMEOUT.to_owned(),
                value: value.to_owned(),
                reason: "expected a whole number of seconds".to_owned(),
            })?;
            settings.lock_timeout = Duration::from_secs(seconds);
        }

        settings.create_tables = env.truthy(CREATE_TABLE, true)?;

        Ok(settings)
    }
}

/// Connection provider shared by every SQLite recorder built from it.
///
/// Table names passed to the recorder constructors must be plain SQL
/// identifiers; they are interpolated into DDL and queries as-is.
#[derive(Debug, Clone)]
pub struct Datastore {
    writer: SqlitePool,
    reader: SqlitePool,
    create_tables: bool,
}

impl Datastore {
    /// Opens (or creates) the configured database and prepares the
    /// writer and reader pools.
    pub async fn connect(settings: Settings) -> Result<Self, PersistenceError> {
        let in_memory = settings.dbname == MEMORY_DB;

        let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", settings.dbname))
            .map_err(|e| PersistenceError::Transport(anyhow::Error::new(e)))?
            .create_if_missing(true)
            .busy_timeout(settings.lock_timeout);

        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(map_sqlx_error)?;

        // Force the writer connection open so the database file exists
        // before the read-only pool connects to it.
        sqlx::query("SELECT 1")
            .execute(&writer)
            .await
            .map_err(map_sqlx_error)?;

        let reader = if in_memory {
            writer.clone()
        } else {
            // Only the select paths use this pool; WAL mode lets these
            // connections read concurrently with the single writer.
            SqlitePoolOptions::new()
                .max_connections(settings.pool_size)
                .connect_with(options.create_if_missing(false))
                .await
                .map_err(map_sqlx_error)?
        };

        tracing::debug!(
            dbname = %settings.dbname,
            in_memory,
            "connected sqlite datastore"
        );

        Ok(Self {
            writer,
            reader,
            create_tables: settings.create_tables,
        })
    }

    pub(crate) fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    pub(crate) fn should_create_tables(&self) -> bool {
        self.create_tables
    }

    /// Returns an aggregate recorder over the named events table,
    /// running its idempotent DDL when `create_tables` is enabled.
    pub async fn aggregate_recorder(
        &self,
        events_table: &str,
    ) -> Result<aggregate::Recorder, PersistenceError> {
        aggregate::Recorder::prepare(self, events_table).await
    }

    /// Returns an aggregate recorder for snapshots. Snapshots are plain
    /// stored events at this layer; only the table differs.
    pub async fn snapshot_recorder(
        &self,
        snapshots_table: &str,
    ) -> Result<aggregate::Recorder, PersistenceError> {
        aggregate::Recorder::prepare(self, snapshots_table).await
    }

    /// Returns an application recorder over the named events table.
    pub async fn application_recorder(
        &self,
        events_table: &str,
    ) -> Result<application::Recorder, PersistenceError> {
        application::Recorder::prepare(self, events_table).await
    }

    /// Returns a tracking recorder over the named tracking table.
    pub async fn tracking_recorder(
        &self,
        tracking_table: &str,
    ) -> Result<tracking::Recorder, PersistenceError> {
        tracking::Recorder::prepare(self, tracking_table).await
    }

    /// Returns a process recorder over the named events and tracking
    /// tables.
    pub async fn process_recorder(
        &self,
        events_table: &str,
        tracking_table: &str,
    ) -> Result<process::Recorder, PersistenceError> {
        process::Recorder::prepare(self, events_table, tracking_table).await
    }

    /// Closes both pools; pending subscribers and waiters fail with
    /// transport errors.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

// SQLITE_BUSY and friends surface when the write lock cannot be
// obtained within busy_timeout.
fn is_busy(code: Option<&str>) -> bool {
    matches!(code, Some("5" | "261" | "517"))
}

fn is_unique_violation(code: Option<&str>) -> bool {
    // 1555: SQLITE_CONSTRAINT_PRIMARYKEY, 2067: SQLITE_CONSTRAINT_UNIQUE
    matches!(code, Some("1555" | "2067"))
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::PoolTimedOut => PersistenceError::PoolExhausted,
        sqlx::Error::Database(db) if is_busy(db.code().as_deref()) => PersistenceError::Timeout,
        other => PersistenceError::Transport(anyhow::Error::new(other)),
    }
}

/// Maps an insert-time error, distinguishing version conflicts from
/// tracking conflicts by the table the violated constraint names.
pub(crate) fn map_insert_error(err: sqlx::Error, tracking_table: Option<&str>) -> InsertError {
    if let sqlx::Error::Database(db) = &err {
        if is_unique_violation(db.code().as_deref()) {
            let detail = db.message().to_owned();
            let on_tracking = tracking_table
                .map_or(false, |table| detail.contains(&format!("{table}.application_name")));

            return if on_tracking {
                IntegrityError::Tracking { detail }.into()
            } else {
                IntegrityError::Version { detail }.into()
            };
        }
    }

    InsertError::Persistence(map_sqlx_error(err))
}
