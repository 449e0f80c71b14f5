//! Aggregate recorder over a PostgreSQL events table, without an
//! application sequence.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use chronicle::event::{OriginatorId, Recording, StoredEvent};
use chronicle::recorder::{self, EventSelect, InsertError, PersistenceError};

use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};

pub(crate) fn try_get_column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, PersistenceError>
where
    T: sqlx::Type<sqlx::Postgres> + sqlx::Decode<'r, sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| PersistenceError::Transport(anyhow::anyhow!("failed to read column '{name}': {e}")))
}

pub(crate) fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, PersistenceError> {
    let originator_id: Uuid = try_get_column(row, "originator_id")?;
    let version: i64 = try_get_column(row, "originator_version")?;

    Ok(StoredEvent {
        originator_id,
        originator_version: version as u64,
        topic: try_get_column(row, "topic")?,
        state: try_get_column(row, "state")?,
    })
}

pub(crate) async fn select_events(
    pool: &PgPool,
    table: &str,
    originator_id: &OriginatorId,
    select: EventSelect,
) -> Result<Vec<StoredEvent>, PersistenceError> {
    let mut sql = format!(
        "SELECT originator_id, originator_version, topic, state \
         FROM {table} WHERE originator_id = $1"
    );
    let mut placeholder = 1;

    if select.gt.is_some() {
        placeholder += 1;
        sql.push_str(&format!(" AND originator_version > ${placeholder}"));
    }
    if select.lte.is_some() {
        placeholder += 1;
        sql.push_str(&format!(" AND originator_version <= ${placeholder}"));
    }
    sql.push_str(" ORDER BY originator_version");
    if select.desc {
        sql.push_str(" DESC");
    }
    if select.limit.is_some() {
        placeholder += 1;
        sql.push_str(&format!(" LIMIT ${placeholder}"));
    }

    let mut query = sqlx::query(&sql).bind(originator_id);
    if let Some(gt) = select.gt {
        query = query.bind(gt as i64);
    }
    if let Some(lte) = select.lte {
        query = query.bind(lte as i64);
    }
    if let Some(limit) = select.limit {
        query = query.bind(limit as i64);
    }

    let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
    rows.iter().map(stored_event_from_row).collect()
}

/// PostgreSQL implementation of the
/// [`AggregateRecorder`][recorder::AggregateRecorder] contract.
///
/// Aggregate-only inserts take no table lock: the primary key on
/// `(originator_id, originator_version)` is the only serialization
/// needed when no notification ids are assigned.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub(crate) pool: PgPool,
    pub(crate) events_table: String,
    pub(crate) lock_timeout_ms: u128,
    pub(crate) idle_timeout_ms: Option<u128>,
}

impl Recorder {
    pub(crate) async fn prepare(
        datastore: &Datastore,
        events_table: &str,
    ) -> Result<Self, PersistenceError> {
        let settings = datastore.settings();
        let recorder = Self {
            pool: datastore.pool().clone(),
            events_table: settings.qualified(events_table),
            lock_timeout_ms: settings.lock_timeout.as_millis(),
            idle_timeout_ms: settings.idle_in_transaction_timeout.map(|t| t.as_millis()),
        };

        if settings.create_tables {
            recorder.create_tables().await?;
        }

        Ok(recorder)
    }

    /// Runs the idempotent schema DDL for this recorder's table.
    pub async fn create_tables(&self) -> Result<(), PersistenceError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                originator_id uuid NOT NULL, \
                originator_version bigint NOT NULL, \
                topic text NOT NULL, \
                state bytea NOT NULL, \
                PRIMARY KEY (originator_id, originator_version))",
            table = self.events_table
        );

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

pub(crate) async fn configure_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    lock_timeout_ms: u128,
    idle_timeout_ms: Option<u128>,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("SET LOCAL lock_timeout = '{lock_timeout_ms}ms'"))
        .execute(&mut **tx)
        .await?;

    if let Some(idle) = idle_timeout_ms {
        sqlx::query(&format!(
            "SET LOCAL idle_in_transaction_session_timeout = '{idle}ms'"
        ))
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl recorder::AggregateRecorder for Recorder {
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        configure_transaction(&mut tx, self.lock_timeout_ms, self.idle_timeout_ms)
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        let sql = format!(
            "INSERT INTO {table} (originator_id, originator_version, topic, state) \
             VALUES ($1, $2, $3, $4)",
            table = self.events_table
        );

        let mut recordings = Vec::with_capacity(events.len());
        for event in &events {
            sqlx::query(&sql)
                .bind(event.originator_id)
                .bind(event.originator_version as i64)
                .bind(&event.topic)
                .bind(&event.state)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_insert_error(e, None))?;

            recordings.push(Recording {
                originator_id: event.originator_id,
                originator_version: event.originator_version,
                notification_id: None,
            });
        }

        tx.commit()
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        Ok(recordings)
    }

    async fn select_events(
        &self,
        originator_id: &OriginatorId,
        select: EventSelect,
    ) -> Result<Vec<StoredEvent>, PersistenceError> {
        select_events(&self.pool, &self.events_table, originator_id, select).await
    }
}
