//! Application recorder over a PostgreSQL events table with a
//! `bigserial` notification-id column.
//!
//! Insert transactions take the events table lock in `EXCLUSIVE` mode,
//! held until commit, so notification ids are assigned in commit order
//! and `max_notification_id` is a safe high-water mark for tailers.
//! Readers take only share-mode locks and are never blocked.
//!
//! Live subscriptions use `LISTEN`/`NOTIFY` on a channel named after
//! the events table, with a bounded polling fallback.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use chronicle::event::{Notification, OriginatorId, Recording, StoredEvent};
use chronicle::recorder::{self, EventSelect, InsertError, PersistenceError, SubscribeError};
use chronicle::subscription::{self, Subscription, POLL_INTERVAL, SUBSCRIPTION_BUFFER};
use chronicle::version::NotificationId;

use crate::aggregate::{configure_transaction, select_events, try_get_column};
use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};

const PAGE_SIZE: usize = 100;

pub(crate) fn notification_from_row(row: &PgRow) -> Result<Notification, PersistenceError> {
    let id: i64 = try_get_column(row, "notification_id")?;
    let version: i64 = try_get_column(row, "originator_version")?;

    Ok(Notification {
        id: id as NotificationId,
        originator_id: try_get_column(row, "originator_id")?,
        originator_version: version as u64,
        topic: try_get_column(row, "topic")?,
        state: try_get_column(row, "state")?,
    })
}

pub(crate) async fn append_events(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    events: &[StoredEvent],
) -> Result<Vec<Recording>, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {table} (originator_id, originator_version, topic, state) \
         VALUES ($1, $2, $3, $4) RETURNING notification_id"
    );

    let mut recordings = Vec::with_capacity(events.len());
    for event in events {
        let row = sqlx::query(&sql)
            .bind(event.originator_id)
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

pub(crate) async fn lock_events_table(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
) -> Result<(), sqlx::Error> {
    // EXCLUSIVE mode conflicts with itself but not with the share-mode
    // locks plain selects take, so readers proceed while writers queue.
    sqlx::query(&format!("LOCK TABLE {table} IN EXCLUSIVE MODE"))
        .execute(&mut **tx)
        .await
        .map(|_| ())
}

pub(crate) async fn notify_inserted(
    tx: &mut Transaction<'_, Postgres>,
    channel: &str,
    max_id: NotificationId,
) -> Result<(), sqlx::Error> {
    // NOTIFY fires on commit, which is exactly when the new ids become
    // visible to tailers.
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(max_id.to_string())
        .execute(&mut **tx)
        .await
        .map(|_| ())
}

pub(crate) async fn select_notifications(
    pool: &PgPool,
    table: &str,
    start: NotificationId,
    limit: usize,
    stop: Option<NotificationId>,
    topics: &[String],
) -> Result<Vec<Notification>, PersistenceError> {
    let mut sql = format!(
        "SELECT notification_id, originator_id, originator_version, topic, state \
         FROM {table} WHERE notification_id >= $1"
    );
    let mut placeholder = 1;

    if stop.is_some() {
        placeholder += 1;
        sql.push_str(&format!(" AND notification_id <= ${placeholder}"));
    }
    if !topics.is_empty() {
        placeholder += 1;
        sql.push_str(&format!(" AND topic = ANY(${placeholder})"));
    }
    placeholder += 1;
    sql.push_str(&format!(" ORDER BY notification_id LIMIT ${placeholder}"));

    let mut query = sqlx::query(&sql).bind(start as i64);
    if let Some(stop) = stop {
        query = query.bind(stop as i64);
    }
    if !topics.is_empty() {
        query = query.bind(topics.to_vec());
    }
    query = query.bind(limit as i64);

    let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
    rows.iter().map(notification_from_row).collect()
}

pub(crate) async fn max_notification_id(
    pool: &PgPool,
    table: &str,
) -> Result<Option<NotificationId>, PersistenceError> {
    let max: Option<i64> =
        sqlx::query_scalar(&format!("SELECT MAX(notification_id) FROM {table}"))
            .fetch_one(pool)
            .await
            .map_err(map_sqlx_error)?;

    Ok(max.map(|id| id as NotificationId))
}

/// Opens a `LISTEN`-driven subscription: catch-up pages after `gt`,
/// then a live tail woken by `NOTIFY` with a bounded polling fallback.
pub(crate) fn spawn_subscription(
    pool: PgPool,
    table: String,
    channel: String,
    gt: Option<NotificationId>,
    topics: Vec<String>,
) -> Subscription {
    let (mut feed, sub) = subscription::channel(SUBSCRIPTION_BUFFER);

    tokio::spawn(async move {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(err) => {
                let _ = feed.deliver(Err(map_sqlx_error(err))).await;
                return;
            }
        };
        if let Err(err) = listener.listen(&channel).await {
            let _ = feed.deliver(Err(map_sqlx_error(err))).await;
            return;
        }

        let mut last = gt.unwrap_or(0);

        loop {
            loop {
                let page = match select_notifications(
                    &pool,
                    &table,
                    last + 1,
                    PAGE_SIZE,
                    None,
                    &topics,
                )
                .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        let _ = feed.deliver(Err(err)).await;
                        return;
                    }
                };

                let caught_up = page.len() < PAGE_SIZE;
                for notification in page {
                    last = notification.id;
                    if feed.deliver(Ok(notification)).await.is_err() {
                        return;
                    }
                }
                if caught_up {
                    break;
                }
            }

            tokio::select! {
                received = listener.recv() => {
                    if let Err(err) = received {
                        tracing::warn!(
                            error = %err,
                            channel = %channel,
                            "listener interrupted, falling back to polling"
                        );
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
                () = feed.stopped() => return,
                () = tokio::time::sleep(POLL_INTERVAL) => {},
            }
        }
    });

    sub
}

/// PostgreSQL implementation of the
/// [`ApplicationRecorder`][recorder::ApplicationRecorder] contract.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub(crate) pool: PgPool,
    pub(crate) events_table: String,
    pub(crate) channel: String,
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
            channel: events_table.to_owned(),
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
        let table = &self.events_table;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                originator_id uuid NOT NULL, \
                originator_version bigint NOT NULL, \
                topic text NOT NULL, \
                state bytea NOT NULL, \
                notification_id bigserial, \
                PRIMARY KEY (originator_id, originator_version))"
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let index = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {channel}_notification_id_idx \
             ON {table} (notification_id)",
            channel = self.channel
        );
        sqlx::query(&index)
            .execute(&self.pool)
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
            .pool
            .begin()
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        configure_transaction(&mut tx, self.lock_timeout_ms, self.idle_timeout_ms)
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        lock_events_table(&mut tx, &self.events_table)
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        let recordings = append_events(&mut tx, &self.events_table, &events)
            .await
            .map_err(|e| map_insert_error(e, None))?;

        if let Some(max_id) = recordings.iter().filter_map(|r| r.notification_id).max() {
            notify_inserted(&mut tx, &self.channel, max_id)
                .await
                .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;
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

#[async_trait]
impl recorder::ApplicationRecorder for Recorder {
    async fn select_notifications(
        &self,
        start: NotificationId,
        limit: usize,
        stop: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Vec<Notification>, PersistenceError> {
        select_notifications(&self.pool, &self.events_table, start, limit, stop, topics).await
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, PersistenceError> {
        max_notification_id(&self.pool, &self.events_table).await
    }

    fn supports_subscribe(&self) -> bool {
        true
    }

    async fn subscribe(
        &self,
        gt: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Subscription, SubscribeError> {
        Ok(spawn_subscription(
            self.pool.clone(),
            self.events_table.clone(),
            self.channel.clone(),
            gt,
            topics.to_vec(),
        ))
    }
}
