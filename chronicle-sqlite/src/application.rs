//! Application recorder over a SQLite events table with a
//! notification-id column.
//!
//! The single-writer pool serializes insert transactions, so
//! notification ids are assigned in commit order without any explicit
//! table lock. Live subscriptions are not supported by this backend;
//! [`subscribe`][chronicle::recorder::ApplicationRecorder::subscribe]
//! refuses with [`CapabilityError::NoSubscribe`], which the event store
//! surfaces at construction time.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use chronicle::event::{Notification, OriginatorId, Recording, StoredEvent};
use chronicle::recorder::{
    self, CapabilityError, EventSelect, InsertError, PersistenceError, SubscribeError,
};
use chronicle::subscription::Subscription;
use chronicle::version::NotificationId;

use crate::aggregate::{
    originator_id_text, parse_originator_id, select_events, try_get_column,
};
use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};

pub(crate) fn notification_from_row(row: &SqliteRow) -> Result<Notification, PersistenceError> {
    let id: i64 = try_get_column(row, "notification_id")?;
    let id_text: String = try_get_column(row, "originator_id")?;
    let version: i64 = try_get_column(row, "originator_version")?;

    Ok(Notification {
        id: id as NotificationId,
        originator_id: parse_originator_id(&id_text)?,
        originator_version: version as u64,
        topic: try_get_column(row, "topic")?,
        state: try_get_column(row, "state")?,
    })
}

pub(crate) async fn append_events(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    events: &[StoredEvent],
) -> Result<Vec<Recording>, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {table} (originator_id, originator_version, topic, state) \
         VALUES (?, ?, ?, ?) RETURNING notification_id"
    );

    let mut recordings = Vec::with_capacity(events.len());
    for event in events {
        let row = sqlx::query(&sql)
            .bind(originator_id_text(&event.originator_id))
            .bind(event.originator_version as i64)
            .bind(&event.topic)
            .bind(&event.state)
            .fetch_one(&mut **tx)
            .await?;

        let id: i64 = row.try_get(0)?;
        recordings.push(Recording {
            originator_id: event.originator_id,
            originator_version: event.originator_version,
            notification_id: Some(id as NotificationId),
        });
    }

    Ok(recordings)
}

pub(crate) async fn select_notifications(
    pool: &SqlitePool,
    table: &str,
    start: NotificationId,
    limit: usize,
    stop: Option<NotificationId>,
    topics: &[String],
) -> Result<Vec<Notification>, PersistenceError> {
    let mut sql = format!(
        "SELECT notification_id, originator_id, originator_version, topic, state \
         FROM {table} WHERE notification_id >= ?"
    );
    if stop.is_some() {
        sql.push_str(" AND notification_id <= ?");
    }
    if !topics.is_empty() {
        sql.push_str(" AND topic IN (");
        sql.push_str(&vec!["?"; topics.len()].join(", "));
        sql.push(')');
    }
    sql.push_str(" ORDER BY notification_id LIMIT ?");

    let mut query = sqlx::query(&sql).bind(start as i64);
    if let Some(stop) = stop {
        query = query.bind(stop as i64);
    }
    for topic in topics {
        query = query.bind(topic);
    }
    query = query.bind(limit as i64);

    let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
    rows.iter().map(notification_from_row).collect()
}

pub(crate) async fn max_notification_id(
    pool: &SqlitePool,
    table: &str,
) -> Result<Option<NotificationId>, PersistenceError> {
    let max: Option<i64> =
        sqlx::query_scalar(&format!("SELECT MAX(notification_id) FROM {table}"))
            .fetch_one(pool)
            .await
            .map_err(map_sqlx_error)?;

    Ok(max.map(|id| id as NotificationId))
}

/// SQLite implementation of the
/// [`ApplicationRecorder`][recorder::ApplicationRecorder] contract,
/// except for live subscriptions (see the module documentation).
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
        let table = &self.events_table;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                notification_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                originator_id TEXT NOT NULL, \
                originator_version INTEGER NOT NULL, \
                topic TEXT NOT NULL, \
                state BLOB NOT NULL)"
        );
        sqlx::query(&ddl)
            .execute(&self.writer)
            .await
            .map_err(map_sqlx_error)?;

        let index = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_originator_idx \
             ON {table} (originator_id, originator_version)"
        );
        sqlx::query(&index)
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

        let recordings = append_events(&mut tx, &self.events_table, &events)
            .await
            .map_err(|e| map_insert_error(e, None))?;

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

#[async_trait]
impl recorder::ApplicationRecorder for Recorder {
    async fn select_notifications(
        &self,
        start: NotificationId,
        limit: usize,
        stop: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Vec<Notification>, PersistenceError> {
        select_notifications(&self.reader, &self.events_table, start, limit, stop, topics).await
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, PersistenceError> {
        max_notification_id(&self.reader, &self.events_table).await
    }

    fn supports_subscribe(&self) -> bool {
        false
    }

    async fn subscribe(
        &self,
        _gt: Option<NotificationId>,
        _topics: &[String],
    ) -> Result<Subscription, SubscribeError> {
        Err(CapabilityError::NoSubscribe.into())
    }
}
