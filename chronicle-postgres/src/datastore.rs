//! Contains the PostgreSQL [`Datastore`]: connection pooling, schema
//! bootstrap and the recorder constructors.
//!
//! All recorders built from one datastore share its pool; each
//! operation acquires a connection for the duration of a single
//! transaction and returns it.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use chronicle::env::{EnvError, Environment, CREATE_TABLE};
use chronicle::recorder::{InsertError, IntegrityError, PersistenceError};

use crate::{aggregate, application, process, tracking};

/// Environment key holding the database name.
pub const POSTGRES_DBNAME: &str = "POSTGRES_DBNAME";
/// Environment key holding the server host.
pub const POSTGRES_HOST: &str = "POSTGRES_HOST";
/// Environment key holding the server port.
pub const POSTGRES_PORT: &str = "POSTGRES_PORT";
/// Environment key holding the user name.
pub const POSTGRES_USER: &str = "POSTGRES_USER";
/// Environment key holding the password.
pub const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
/// Environment key holding the connection-acquire timeout in seconds.
pub const POSTGRES_CONNECT_TIMEOUT: &str = "POSTGRES_CONNECT_TIMEOUT";
/// Environment key holding the base pool size.
pub const POSTGRES_POOL_SIZE: &str = "POSTGRES_POOL_SIZE";
/// Environment key holding the pool overflow allowance.
pub const POSTGRES_MAX_OVERFLOW: &str = "POSTGRES_MAX_OVERFLOW";
/// Environment key holding the advisory cap on waiting acquirers.
pub const POSTGRES_MAX_WAITING: &str = "POSTGRES_MAX_WAITING";
/// Environment key holding the connection retirement age in seconds.
pub const POSTGRES_CONN_MAX_AGE: &str = "POSTGRES_CONN_MAX_AGE";
/// Environment key enabling liveness checks before reuse.
pub const POSTGRES_PRE_PING: &str = "POSTGRES_PRE_PING";
/// Environment key holding the insertion lock timeout in seconds.
pub const POSTGRES_LOCK_TIMEOUT: &str = "POSTGRES_LOCK_TIMEOUT";
/// Environment key holding the schema qualifier for table names.
pub const POSTGRES_SCHEMA: &str = "POSTGRES_SCHEMA";
/// Environment key holding the idle-in-transaction timeout in seconds.
pub const POSTGRES_IDLE_IN_TRANSACTION_TIMEOUT: &str = "POSTGRES_IDLE_IN_TRANSACTION_TIMEOUT";

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_MAX_OVERFLOW: u32 = 10;
const DEFAULT_MAX_WAITING: u32 = 20;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for a PostgreSQL [`Datastore`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database name.
    pub dbname: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Bound on acquiring a pooled connection.
    pub connect_timeout: Duration,
    /// Base number of pooled connections.
    pub pool_size: u32,
    /// Connections allowed beyond `pool_size` under load.
    pub max_overflow: u32,
    /// Advisory cap on acquirers queued for a connection. The pool
    /// bounds waiters by `connect_timeout` rather than by count;
    /// exhaustion surfaces as
    /// [`PersistenceError::PoolExhausted`].
    pub max_waiting: u32,
    /// Retire connections older than this on return.
    pub conn_max_age: Option<Duration>,
    /// Check connection liveness before reuse.
    pub pre_ping: bool,
    /// Bound on acquiring the insertion table lock.
    pub lock_timeout: Duration,
    /// Abort transactions idling longer than this.
    pub idle_in_transaction_timeout: Option<Duration>,
    /// Optional namespace qualifier for table names.
    pub schema: Option<String>,
    /// Whether recorder constructors run idempotent schema DDL.
    pub create_tables: bool,
}

impl Settings {
    /// Returns settings for the given database, with default pooling.
    pub fn new(
        dbname: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            dbname: dbname.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: password.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            max_waiting: DEFAULT_MAX_WAITING,
            conn_max_age: None,
            pre_ping: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            idle_in_transaction_timeout: None,
            schema: None,
            create_tables: true,
        }
    }

    /// Reads settings from the `POSTGRES_*` and `CREATE_TABLE`
    /// environment keys.
    pub fn from_env(env: &Environment) -> Result<Self, EnvError> {
        let required = |key: &str| {
            env.get(key)
                .map(str::to_owned)
                .ok_or_else(|| EnvError::Missing {
                    key: key.to_owned(),
                })
        };

        let mut settings = Self::new(
            required(POSTGRES_DBNAME)?,
            env.get(POSTGRES_HOST).unwrap_or("127.0.0.1").to_owned(),
            required(POSTGRES_USER)?,
            required(POSTGRES_PASSWORD)?,
        );

        if let Some(value) = env.get(POSTGRES_PORT) {
            settings.port = parse_number(POSTGRES_PORT, value)?;
        }
        if let Some(value) = env.get(POSTGRES_CONNECT_TIMEOUT) {
            settings.connect_timeout = Duration::from_secs(parse_number(POSTGRES_CONNECT_TIMEOUT, value)?);
        }
        if let Some(value) = env.get(POSTGRES_POOL_SIZE) {
            settings.pool_size = parse_number(POSTGRES_POOL_SIZE, value)?;
        }
        if let Some(value) = env.get(POSTGRES_MAX_OVERFLOW) {
            settings.max_overflow = parse_number(POSTGRES_MAX_OVERFLOW, value)?;
        }
        if let Some(value) = env.get(POSTGRES_MAX_WAITING) {
            settings.max_waiting = parse_number(POSTGRES_MAX_WAITING, value)?;
        }
        if let Some(value) = env.get(POSTGRES_CONN_MAX_AGE) {
            settings.conn_max_age =
                Some(Duration::from_secs(parse_number(POSTGRES_CONN_MAX_AGE, value)?));
        }
        settings.pre_ping = env.truthy(POSTGRES_PRE_PING, false)?;
        if let Some(value) = env.get(POSTGRES_LOCK_TIMEOUT) {
            settings.lock_timeout = Duration::from_secs(parse_number(POSTGRES_LOCK_TIMEOUT, value)?);
        }
        if let Some(value) = env.get(POSTGRES_IDLE_IN_TRANSACTION_TIMEOUT) {
            settings.idle_in_transaction_timeout = Some(Duration::from_secs(parse_number(
                POSTGRES_IDLE_IN_TRANSACTION_TIMEOUT,
                value,
            )?));
        }
        settings.schema = env.get(POSTGRES_SCHEMA).map(str::to_owned);
        settings.create_tables = env.truthy(CREATE_TABLE, true)?;

        Ok(settings)
    }

    pub(crate) fn qualified(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_owned(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, EnvError> {
    value.parse().map_err(|_| EnvError::Invalid {
        key: key.to_owned(),
        value: value.to_owned(),
        reason: "expected a whole number".to_owned(),
    })
}

/// Connection provider shared by every PostgreSQL recorder built from
/// it.
///
/// Table names passed to the recorder constructors must be plain SQL
/// identifiers; they are interpolated into DDL and queries as-is, with
/// the configured schema qualifier applied.
#[derive(Debug, Clone)]
pub struct Datastore {
    pool: PgPool,
    settings: Settings,
}

impl Datastore {
    /// Connects the pool and, when `create_tables` is enabled with a
    /// schema configured, ensures the schema exists.
    pub async fn connect(settings: Settings) -> Result<Self, PersistenceError> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.dbname);

        let pool = PgPoolOptions::new()
            .max_connections(settings.pool_size + settings.max_overflow)
            .acquire_timeout(settings.connect_timeout)
            .max_lifetime(settings.conn_max_age)
            .test_before_acquire(settings.pre_ping)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        if settings.create_tables {
            if let Some(schema) = &settings.schema {
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                    .execute(&pool)
                    .await
                    .map_err(map_sqlx_error)?;
            }
        }

        tracing::debug!(
            dbname = %settings.dbname,
            host = %settings.host,
            pool_size = settings.pool_size,
            max_overflow = settings.max_overflow,
            "connected postgres datastore"
        );

        Ok(Self { pool, settings })
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
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

    /// Closes the pool; pending subscribers and waiters fail with
    /// transport errors.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::PoolTimedOut => PersistenceError::PoolExhausted,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03") => {
            // lock_not_available: the insertion lock timed out.
            PersistenceError::Timeout
        }
        other => PersistenceError::Transport(anyhow::Error::new(other)),
    }
}

/// Maps an insert-time error, distinguishing version conflicts from
/// tracking conflicts by the table the violated constraint belongs to.
pub(crate) fn map_insert_error(err: sqlx::Error, tracking_table: Option<&str>) -> InsertError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            let detail = db.message().to_owned();
            let on_tracking = tracking_table.map_or(false, |table| {
                // Constraint names never carry the schema qualifier.
                let table = table.rsplit('.').next().unwrap_or(table);
                db.constraint()
                    .map_or(detail.contains(table), |constraint| constraint.starts_with(table))
            });

            return if on_tracking {
                IntegrityError::Tracking { detail }.into()
            } else {
                IntegrityError::Version { detail }.into()
            };
        }
    }

    InsertError::Persistence(map_sqlx_error(err))
}
