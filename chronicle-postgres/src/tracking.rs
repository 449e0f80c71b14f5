//! Tracking recorder over a PostgreSQL tracking table.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;

use chronicle::event::Tracking;
use chronicle::recorder::{self, InsertError, PersistenceError, TimeoutError, WaitError};
use chronicle::version::NotificationId;

use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};

const WAIT_POLL: Duration = Duration::from_millis(100);

pub(crate) async fn insert_tracking(
    pool: &PgPool,
    table: &str,
    tracking: &Tracking,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {table} (application_name, notification_id) VALUES ($1, $2)"
    ))
    .bind(&tracking.application_name)
    .bind(tracking.notification_id as i64)
    .execute(pool)
    .await
    .map(|_| ())
}

pub(crate) async fn max_tracking_id(
    pool: &PgPool,
    table: &str,
    application_name: &str,
) -> Result<Option<NotificationId>, PersistenceError> {
    let max: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT MAX(notification_id) FROM {table} WHERE application_name = $1"
    ))
    .bind(application_name)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(max.map(|id| id as NotificationId))
}

pub(crate) async fn has_tracking_id(
    pool: &PgPool,
    table: &str,
    application_name: &str,
    notification_id: NotificationId,
) -> Result<bool, PersistenceError> {
    sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {table} \
         WHERE application_name = $1 AND notification_id = $2)"
    ))
    .bind(application_name)
    .bind(notification_id as i64)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)
}

pub(crate) async fn wait(
    pool: &PgPool,
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

/// PostgreSQL implementation of the
/// [`TrackingRecorder`][recorder::TrackingRecorder] contract.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub(crate) pool: PgPool,
    pub(crate) tracking_table: String,
}

impl Recorder {
    pub(crate) async fn prepare(
        datastore: &Datastore,
        tracking_table: &str,
    ) -> Result<Self, PersistenceError> {
        let settings = datastore.settings();
        let recorder = Self {
            pool: datastore.pool().clone(),
            tracking_table: settings.qualified(tracking_table),
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
                application_name text NOT NULL, \
                notification_id bigint NOT NULL, \
                PRIMARY KEY (application_name, notification_id))",
            table = self.tracking_table
        );

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl recorder::TrackingRecorder for Recorder {
    async fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError> {
        insert_tracking(&self.pool, &self.tracking_table, &tracking)
            .await
            .map_err(|e| map_insert_error(e, Some(&self.tracking_table)))
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError> {
        max_tracking_id(&self.pool, &self.tracking_table, application_name).await
    }

    async fn has_tracking_id(
        &self,
        application_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, PersistenceError> {
        has_tracking_id(
            &self.pool,
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
            &self.pool,
            &self.tracking_table,
            application_name,
            notification_id,
            timeout,
        )
        .await
    }
}
