//! Tracking recorder over a SQLite tracking table.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::SqlitePool;

use chronicle::event::Tracking;
use chronicle::recorder::{self, InsertError, PersistenceError, TimeoutError, WaitError};
use chronicle::version::NotificationId;

use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};

// SQLite cannot push tracking inserts to waiters, so wait() polls.
const WAIT_POLL: Duration = Duration::from_millis(100);

pub(crate) async fn insert_tracking(
    pool: &SqlitePool,
    table: &str,
    tracking: &Tracking,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {table} (application_name, notification_id) VALUES (?, ?)"
    ))
    .bind(&tracking.application_name)
    .bind(tracking.notification_id as i64)
    .execute(pool)
    .await
    .map(|_| ())
}

pub(crate) async fn max_tracking_id(
    pool: &SqlitePool,
    table: &str,
    application_name: &str,
) -> Result<Option<NotificationId>, PersistenceError> {
    let max: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT MAX(notification_id) FROM {table} WHERE application_name = ?"
    ))
    .bind(application_name)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(max.map(|id| id as NotificationId))
}

pub(crate) async fn has_tracking_id(
    pool: &SqlitePool,
    table: &str,
    application_name: &str,
    notification_id: NotificationId,
) -> Result<bool, PersistenceError> {
    let found: i64 = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {table} \
         WHERE application_name = ? AND notification_id = ?)"
    ))
    .bind(application_name)
    .bind(notification_id as i64)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(found != 0)
}

pub(crate) async fn wait(
    pool: &SqlitePool,
    table: &str,
    application_name: &str,
    notification_id: NotificationId,
    timeout: Duration,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;

    loop {
        if has_tracking_id(pool, table, application_name, notification_id).await? {
            return Ok(());
        }

        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(TimeoutError {
                application_name: application_name.to_owned(),
                notification_id,
                waited: timeout,
            }
            .into());
        };

        tokio::time::sleep(remaining.min(WAIT_POLL)).await;
    }
}

/// SQLite implementation of the
/// [`TrackingRecorder`][recorder::TrackingRecorder] contract.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub(crate) writer: SqlitePool,
    pub(crate) reader: SqlitePool,
    pub(crate) tracking_table: String,
}

impl Recorder {
    pub(crate) async fn prepare(
        datastore: &Datastore,
        tracking_table: &str,
    ) -> Result<Self, PersistenceError> {
        let recorder = Self {
            writer: datastore.writer().clone(),
            reader: datastore.reader().clone(),
            tracking_table: tracking_table.to_owned(),
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
                application_name TEXT NOT NULL, \
                notification_id INTEGER NOT NULL, \
                PRIMARY KEY (application_name, notification_id))",
            table = self.tracking_table
        );

        sqlx::query(&ddl)
            .execute(&self.writer)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl recorder::TrackingRecorder for Recorder {
    async fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError> {
        insert_tracking(&self.writer, &self.tracking_table, &tracking)
            .await
            .map_err(|e| map_insert_error(e, Some(&self.tracking_table)))
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError> {
        max_tracking_id(&self.reader, &self.tracking_table, application_name).await
    }

    async fn has_tracking_id(
        &self,
        application_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, PersistenceError> {
        has_tracking_id(
            &self.reader,
            &self.tracking_table,
            application_name,
            notification_id,
        )
        .await
    }

    async fn wait(
        &self,
        application_name: &str,
        notification_id: NotificationId,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        wait(
            &self.reader,
            &self.tracking_table,
            application_name,
            notification_id,
            timeout,
        )
        .await
    }
}
