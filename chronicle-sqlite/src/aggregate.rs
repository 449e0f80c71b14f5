//! Aggregate recorder over a SQLite events table, without an
//! application sequence.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use chronicle::event::{OriginatorId, Recording, StoredEvent};
use chronicle::recorder::{self, EventSelect, InsertError, PersistenceError};

use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};

pub(crate) fn originator_id_text(originator_id: &OriginatorId) -> String {
    originator_id.simple().to_string()
}

pub(crate) fn try_get_column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, PersistenceError>
where
    T: sqlx::Type<sqlx::Sqlite> + sqlx::Decode<'r, sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| PersistenceError::Transport(anyhow::anyhow!("failed to read column '{name}': {e}")))
}

pub(crate) fn parse_originator_id(text: &str) -> Result<OriginatorId, PersistenceError> {
    Uuid::try_parse(text)
        .map_err(|e| PersistenceError::Transport(anyhow::anyhow!("invalid originator id '{text}': {e}")))
}

pub(crate) fn stored_event_from_row(row: &SqliteRow) -> Result<StoredEvent, PersistenceError> {
    let id_text: String = try_get_column(row, "originator_id")?;
    let version: i64 = try_get_column(row, "originator_version")?;

    Ok(StoredEvent {
        originator_id: parse_originator_id(&id_text)?,
        originator_version: version as u64,
        topic: try_get_column(row, "topic")?,
        state: try_get_column(row, "state")?,
    })
}

pub(crate) async fn select_events(
    pool: &SqlitePool,
    table: &str,
    originator_id: &OriginatorId,
    select: EventSelect,
) -> Result<Vec<StoredEvent>, PersistenceError> {
    let mut sql = format!(
        "SELECT originator_id, originator_version, topic, state \
         FROM {table} WHERE originator_id = ?"
    );
    if select.gt.is_some() {
        sql.push_str(" AND originator_version > ?");
    }
    if select.lte.is_some() {
        sql.push_str(" AND originator_version <= ?");
    }
    sql.push_str(" ORDER BY originator_version");
    if select.desc {
        sql.push_str(" DESC");
    }
    if select.limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut query = sqlx::query(&sql).bind(originator_id_text(originator_id));
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

/// SQLite implementation of the
/// [`AggregateRecorder`][recorder::AggregateRecorder] contract.
///
/// The events table has no notification-id column; use
/// [`application::Recorder`][crate::application::Recorder] when the
/// application sequence is needed.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub(crate) writer: SqlitePool,
    pub(crate) reader: SqlitePool,
    pub(crate) events_table: String,
}

impl Recorder {
    pub(crate) async fn prepare(
        datastore: &Datastore,
        events_table: &str,
    ) -> Result<Self, PersistenceError> {
        let recorder = Self {
            writer: datastore.writer().clone(),
            reader: datastore.reader().clone(),
            events_table: events_table.to_owned(),
        };

        if datastore.should_create_tables() {
            recorder.create_tables().await?;
        }

        Ok(recorder)
    }

    /// Runs the idempotent schema DDL for this recorder's table.
    pub async fn create_tables(&self) -> Result<(), PersistenceError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                originator_id TEXT NOT NULL, \
                originator_version INTEGER NOT NULL, \
                topic TEXT NOT NULL, \
                state BLOB NOT NULL, \
                PRIMARY KEY (originator_id, originator_version))",
            table = self.events_table
        );

        sqlx::query(&ddl)
            .execute(&self.writer)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl recorder::AggregateRecorder for Recorder {
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError> {
        let mut tx = self
            .writer
            .begin()
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        let sql = format!(
            "INSERT INTO {table} (originator_id, originator_version, topic, state) \
             VALUES (?, ?, ?, ?)",
            table = self.events_table
        );

        let mut recordings = Vec::with_capacity(events.len());
        for event in &events {
            sqlx::query(&sql)
                .bind(originator_id_text(&event.originator_id))
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
        select_events(&self.reader, &self.events_table, originator_id, select).await
    }
}
