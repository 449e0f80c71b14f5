//! Process recorder over SQLite: the join of the application and
//! tracking recorders, committing events and the optional tracking
//! record in one transaction on the shared writer connection.

use std::time::Duration;

use async_trait::async_trait;

use chronicle::event::{Notification, OriginatorId, Recording, StoredEvent, Tracking};
use chronicle::recorder::{
    self, ApplicationRecorder as _, EventSelect, InsertError, PersistenceError, SubscribeError,
    WaitError,
};
use chronicle::subscription::Subscription;
use chronicle::version::NotificationId;

use crate::datastore::{map_insert_error, map_sqlx_error, Datastore};
use crate::{application, tracking};

/// SQLite implementation of the
/// [`ProcessRecorder`][recorder::ProcessRecorder] contract.
#[derive(Debug, Clone)]
pub struct Recorder {
    events: application::Recorder,
    tracking: tracking::Recorder,
}

impl Recorder {
    pub(crate) async fn prepare(
        datastore: &Datastore,
        events_table: &str,
        tracking_table: &str,
    ) -> Result<Self, PersistenceError> {
        Ok(Self {
            events: application::Recorder::prepare(datastore, events_table).await?,
            tracking: tracking::Recorder::prepare(datastore, tracking_table).await?,
        })
    }

    /// Runs the idempotent schema DDL for both tables.
    pub async fn create_tables(&self) -> Result<(), PersistenceError> {
        self.events.create_tables().await?;
        self.tracking.create_tables().await
    }
}

#[async_trait]
impl recorder::AggregateRecorder for Recorder {
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError> {
        recorder::ProcessRecorder::insert_events_with_tracking(self, events, None).await
    }

    async fn select_events(
        &self,
        originator_id: &OriginatorId,
        select: EventSelect,
    ) -> Result<Vec<StoredEvent>, PersistenceError> {
        recorder::AggregateRecorder::select_events(&self.events, originator_id, select).await
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
        self.events
            .select_notifications(start, limit, stop, topics)
            .await
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, PersistenceError> {
        recorder::ApplicationRecorder::max_notification_id(&self.events).await
    }

    fn supports_subscribe(&self) -> bool {
        false
    }

    async fn subscribe(
        &self,
        gt: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Subscription, SubscribeError> {
        self.events.subscribe(gt, topics).await
    }
}

#[async_trait]
impl recorder::TrackingRecorder for Recorder {
    async fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError> {
        recorder::TrackingRecorder::insert_tracking(&self.tracking, tracking).await
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError> {
        recorder::TrackingRecorder::max_tracking_id(&self.tracking, application_name).await
    }

    async fn has_tracking_id(
        &self,
        application_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, PersistenceError> {
        recorder::TrackingRecorder::has_tracking_id(
            &self.tracking,
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
        recorder::TrackingRecorder::wait(
            &self.tracking,
            application_name,
            notification_id,
            timeout,
        )
        .await
    }
}

#[async_trait]
impl recorder::ProcessRecorder for Recorder {
    async fn insert_events_with_tracking(
        &self,
        events: Vec<StoredEvent>,
        tracking: Option<Tracking>,
    ) -> Result<Vec<Recording>, InsertError> {
        let mut tx = self
            .events
            .writer
            .begin()
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        let recordings = application::append_events(&mut tx, &self.events.events_table, &events)
            .await
            .map_err(|e| map_insert_error(e, Some(&self.tracking.tracking_table)))?;

        if let Some(t) = &tracking {
            sqlx::query(&format!(
                "INSERT INTO {table} (application_name, notification_id) VALUES (?, ?)",
                table = self.tracking.tracking_table
            ))
            .bind(&t.application_name)
            .bind(t.notification_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, Some(&self.tracking.tracking_table)))?;
        }

        tx.commit()
            .await
            .map_err(|e| InsertError::Persistence(map_sqlx_error(e)))?;

        Ok(recordings)
    }
}
