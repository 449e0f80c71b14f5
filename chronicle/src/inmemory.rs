//! In-memory implementations of the recorder contracts, backed by a
//! process-local structure guarded by a writer lock, with
//! [`Notify`]-based wakeups standing in for condition variables.
//!
//! Useful for tests and for applications that want event-sourced
//! semantics without a database; the guarantees are the same as the
//! database-backed recorders, only durability is missing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::event::{Notification, OriginatorId, Recording, StoredEvent, Tracking};
use crate::recorder::{
    self, EventSelect, InsertError, IntegrityError, PersistenceError, SubscribeError,
    TimeoutError, WaitError,
};
use crate::subscription::{self, Subscription, POLL_INTERVAL, SUBSCRIPTION_BUFFER};
use crate::version::NotificationId;

fn apply_select(mut events: Vec<StoredEvent>, select: EventSelect) -> Vec<StoredEvent> {
    events.retain(|event| {
        select.gt.map_or(true, |gt| event.originator_version > gt)
            && select
                .lte
                .map_or(true, |lte| event.originator_version <= lte)
    });

    events.sort_by_key(|event| event.originator_version);

    if select.desc {
        events.reverse();
    }

    if let Some(limit) = select.limit {
        events.truncate(limit);
    }

    events
}

/// In-memory implementation of the
/// [`AggregateRecorder`][recorder::AggregateRecorder] contract, without
/// an application sequence.
#[derive(Debug, Clone, Default)]
pub struct AggregateRecorder {
    streams: Arc<RwLock<HashMap<OriginatorId, Vec<StoredEvent>>>>,
}

impl AggregateRecorder {
    /// Returns an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl recorder::AggregateRecorder for AggregateRecorder {
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError> {
        let mut streams = self
            .streams
            .write()
            .expect("acquire write lock on aggregate recorder");

        let mut staged: HashSet<(OriginatorId, u64)> = HashSet::new();
        for event in &events {
            let pair = (event.originator_id, event.originator_version);
            let recorded = streams.get(&event.originator_id).map_or(false, |stream| {
                stream
                    .iter()
                    .any(|e| e.originator_version == event.originator_version)
            });
            if recorded || !staged.insert(pair) {
                return Err(IntegrityError::Version {
                    detail: format!(
                        "{} v{}",
                        event.originator_id, event.originator_version
                    ),
                }
                .into());
            }
        }

        let mut recordings = Vec::with_capacity(events.len());
        for event in events {
            recordings.push(Recording {
                originator_id: event.originator_id,
                originator_version: event.originator_version,
                notification_id: None,
            });
            streams.entry(event.originator_id).or_default().push(event);
        }

        Ok(recordings)
    }

    async fn select_events(
        &self,
        originator_id: &OriginatorId,
        select: EventSelect,
    ) -> Result<Vec<StoredEvent>, PersistenceError> {
        let streams = self
            .streams
            .read()
            .expect("acquire read lock on aggregate recorder");

        Ok(apply_select(
            streams.get(originator_id).cloned().unwrap_or_default(),
            select,
        ))
    }
}

#[derive(Debug, Default)]
struct SequencedState {
    log: Vec<Notification>,
    versions: HashMap<OriginatorId, BTreeSet<u64>>,
    tracking: HashMap<String, BTreeSet<NotificationId>>,
}

/// The shared substrate of the in-memory application, process and
/// tracking recorders: one writer lock over the whole state, so the
/// combined event-plus-tracking insert of the process recorder is
/// trivially atomic, plus one wakeup per table for subscriptions and
/// [`wait`][recorder::TrackingRecorder::wait].
#[derive(Debug, Default)]
struct Sequenced {
    state: RwLock<SequencedState>,
    events_added: Notify,
    tracking_added: Notify,
}

impl Sequenced {
    fn insert(
        &self,
        events: Vec<StoredEvent>,
        tracking: Option<Tracking>,
    ) -> Result<Vec<Recording>, InsertError> {
        let mut state = self
            .state
            .write()
            .expect("acquire write lock on application recorder");

        if let Some(t) = &tracking {
            let tracked = state
                .tracking
                .get(&t.application_name)
                .map_or(false, |ids| ids.contains(&t.notification_id));
            if tracked {
                return Err(IntegrityError::Tracking {
                    detail: format!("{}#{}", t.application_name, t.notification_id),
                }
                .into());
            }
        }

        let mut staged: HashSet<(OriginatorId, u64)> = HashSet::new();
        for event in &events {
            let pair = (event.originator_id, event.originator_version);
            let recorded = state
                .versions
                .get(&event.originator_id)
                .map_or(false, |versions| versions.contains(&event.originator_version));
            if recorded || !staged.insert(pair) {
                return Err(IntegrityError::Version {
                    detail: format!("{} v{}", event.originator_id, event.originator_version),
                }
                .into());
            }
        }

        let inserted_events = !events.is_empty();
        let inserted_tracking = tracking.is_some();
        let mut recordings = Vec::with_capacity(events.len());

        for event in events {
            let id = state.log.len() as NotificationId + 1;
            recordings.push(Recording {
                originator_id: event.originator_id,
                originator_version: event.originator_version,
                notification_id: Some(id),
            });
            state
                .versions
                .entry(event.originator_id)
                .or_default()
                .insert(event.originator_version);
            state.log.push(Notification {
                id,
                originator_id: event.originator_id,
                originator_version: event.originator_version,
                topic: event.topic,
                state: event.state,
            });
        }

        if let Some(t) = tracking {
            state
                .tracking
                .entry(t.application_name)
                .or_default()
                .insert(t.notification_id);
        }

        drop(state);

        if inserted_events {
            self.events_added.notify_waiters();
        }
        if inserted_tracking {
            self.tracking_added.notify_waiters();
        }

        Ok(recordings)
    }

    fn select_events(&self, originator_id: &OriginatorId, select: EventSelect) -> Vec<StoredEvent> {
        let state = self
            .state
            .read()
            .expect("acquire read lock on application recorder");

        let events = state
            .log
            .iter()
            .filter(|n| n.originator_id == *originator_id)
            .cloned()
            .map(StoredEvent::from)
            .collect();

        apply_select(events, select)
    }

    fn select_notifications(
        &self,
        start: NotificationId,
        limit: usize,
        stop: Option<NotificationId>,
        topics: &[String],
    ) -> Vec<Notification> {
        let state = self
            .state
            .read()
            .expect("acquire read lock on application recorder");

        let from = (start.max(1) as usize - 1).min(state.log.len());

        state.log[from..]
            .iter()
            .take_while(|n| stop.map_or(true, |stop| n.id <= stop))
            .filter(|n| topics.is_empty() || topics.iter().any(|t| t == &n.topic))
            .take(limit)
            .cloned()
            .collect()
    }

    fn max_notification_id(&self) -> Option<NotificationId> {
        let state = self
            .state
            .read()
            .expect("acquire read lock on application recorder");

        let len = state.log.len() as NotificationId;
        (len > 0).then_some(len)
    }

    fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError> {
        {
            let mut state = self
                .state
                .write()
                .expect("acquire write lock on tracking recorder");

            let inserted = state
                .tracking
                .entry(tracking.application_name.clone())
                .or_default()
                .insert(tracking.notification_id);

            if !inserted {
                return Err(IntegrityError::Tracking {
                    detail: format!(
                        "{}#{}",
                        tracking.application_name, tracking.notification_id
                    ),
                }
                .into());
            }
        }

        self.tracking_added.notify_waiters();
        Ok(())
    }

    fn max_tracking_id(&self, application_name: &str) -> Option<NotificationId> {
        let state = self
            .state
            .read()
            .expect("acquire read lock on tracking recorder");

        state
            .tracking
            .get(application_name)
            .and_then(|ids| ids.last().copied())
    }

    fn has_tracking_id(&self, application_name: &str, notification_id: NotificationId) -> bool {
        let state = self
            .state
            .read()
            .expect("acquire read lock on tracking recorder");

        state
            .tracking
            .get(application_name)
            .map_or(false, |ids| ids.contains(&notification_id))
    }

    async fn wait(
        &self,
        application_name: &str,
        notification_id: NotificationId,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so an insert between
            // the check and the sleep still wakes this task.
            let notified = self.tracking_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_tracking_id(application_name, notification_id) {
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

            tokio::select! {
                () = &mut notified => {},
                () = tokio::time::sleep(remaining.min(POLL_INTERVAL)) => {},
            }
        }
    }
}

fn subscribe_sequenced(
    shared: Arc<Sequenced>,
    gt: Option<NotificationId>,
    topics: &[String],
) -> Subscription {
    let (mut feed, sub) = subscription::channel(SUBSCRIPTION_BUFFER);
    let topics = topics.to_vec();
    let mut last = gt.unwrap_or(0);

    tokio::spawn(async move {
        loop {
            let notified = shared.events_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let page: Vec<Notification> = {
                let state = shared
                    .state
                    .read()
                    .expect("acquire read lock on application recorder");

                let from = (last as usize).min(state.log.len());
                let page = state.log[from..]
                    .iter()
                    .filter(|n| topics.is_empty() || topics.iter().any(|t| t == &n.topic))
                    .cloned()
                    .collect();
                last = state.log.len() as NotificationId;
                page
            };

            for notification in page {
                if feed.deliver(Ok(notification)).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                () = &mut notified => {},
                () = feed.stopped() => return,
                () = tokio::time::sleep(POLL_INTERVAL) => {},
            }
        }
    });

    sub
}

/// In-memory implementation of the
/// [`ApplicationRecorder`][recorder::ApplicationRecorder] contract.
#[derive(Debug, Clone, Default)]
pub struct ApplicationRecorder {
    shared: Arc<Sequenced>,
}

impl ApplicationRecorder {
    /// Returns an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl recorder::AggregateRecorder for ApplicationRecorder {
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError> {
        self.shared.insert(events, None)
    }

    async fn select_events(
        &self,
        originator_id: &OriginatorId,
        select: EventSelect,
    ) -> Result<Vec<StoredEvent>, PersistenceError> {
        Ok(self.shared.select_events(originator_id, select))
    }
}

#[async_trait]
impl recorder::ApplicationRecorder for ApplicationRecorder {
    async fn select_notifications(
        &self,
        start: NotificationId,
        limit: usize,
        stop: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Vec<Notification>, PersistenceError> {
        Ok(self.shared.select_notifications(start, limit, stop, topics))
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, PersistenceError> {
        Ok(self.shared.max_notification_id())
    }

    fn supports_subscribe(&self) -> bool {
        true
    }

    async fn subscribe(
        &self,
        gt: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Subscription, SubscribeError> {
        Ok(subscribe_sequenced(Arc::clone(&self.shared), gt, topics))
    }
}

/// In-memory implementation of the
/// [`TrackingRecorder`][recorder::TrackingRecorder] contract.
#[derive(Debug, Clone, Default)]
pub struct TrackingRecorder {
    shared: Arc<Sequenced>,
}

impl TrackingRecorder {
    /// Returns an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl recorder::TrackingRecorder for TrackingRecorder {
    async fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError> {
        self.shared.insert_tracking(tracking)
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError> {
        Ok(self.shared.max_tracking_id(application_name))
    }

    async fn has_tracking_id(
        &self,
        application_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, PersistenceError> {
        Ok(self.shared.has_tracking_id(application_name, notification_id))
    }

    async fn wait(
        &self,
        application_name: &str,
        notification_id: NotificationId,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.shared.wait(application_name, notification_id, timeout).await
    }
}

/// In-memory implementation of the
/// [`ProcessRecorder`][recorder::ProcessRecorder] contract: the
/// application and tracking tables live under one lock, so the combined
/// insert commits atomically.
#[derive(Debug, Clone, Default)]
pub struct ProcessRecorder {
    shared: Arc<Sequenced>,
}

impl ProcessRecorder {
    /// Returns an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl recorder::AggregateRecorder for ProcessRecorder {
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError> {
        self.shared.insert(events, None)
    }

    async fn select_events(
        &self,
        originator_id: &OriginatorId,
        select: EventSelect,
    ) -> Result<Vec<StoredEvent>, PersistenceError> {
        Ok(self.shared.select_events(originator_id, select))
    }
}

#[async_trait]
impl recorder::ApplicationRecorder for ProcessRecorder {
    async fn select_notifications(
        &self,
        start: NotificationId,
        limit: usize,
        stop: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Vec<Notification>, PersistenceError> {
        Ok(self.shared.select_notifications(start, limit, stop, topics))
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, PersistenceError> {
        Ok(self.shared.max_notification_id())
    }

    fn supports_subscribe(&self) -> bool {
        true
    }

    async fn subscribe(
        &self,
        gt: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Subscription, SubscribeError> {
        Ok(subscribe_sequenced(Arc::clone(&self.shared), gt, topics))
    }
}

#[async_trait]
impl recorder::TrackingRecorder for ProcessRecorder {
    async fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError> {
        self.shared.insert_tracking(tracking)
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError> {
        Ok(self.shared.max_tracking_id(application_name))
    }

    async fn has_tracking_id(
        &self,
        application_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, PersistenceError> {
        Ok(self.shared.has_tracking_id(application_name, notification_id))
    }

    async fn wait(
        &self,
        application_name: &str,
        notification_id: NotificationId,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.shared.wait(application_name, notification_id, timeout).await
    }
}

#[async_trait]
impl recorder::ProcessRecorder for ProcessRecorder {
    async fn insert_events_with_tracking(
        &self,
        events: Vec<StoredEvent>,
        tracking: Option<Tracking>,
    ) -> Result<Vec<Recording>, InsertError> {
        self.shared.insert(events, tracking)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::recorder::{
        AggregateRecorder as _, ApplicationRecorder as _, ProcessRecorder as _,
        TrackingRecorder as _,
    };

    fn stored(originator_id: Uuid, version: u64) -> StoredEvent {
        stored_with_topic(originator_id, version, "test:Happened")
    }

    fn stored_with_topic(originator_id: Uuid, version: u64, topic: &str) -> StoredEvent {
        StoredEvent {
            originator_id,
            originator_version: version,
            topic: topic.to_owned(),
            state: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn aggregate_events_round_trip() {
        let recorder = AggregateRecorder::new();
        let id = Uuid::new_v4();

        let recordings = recorder
            .insert_events(vec![stored(id, 1), stored(id, 2)])
            .await
            .expect("insert should not fail");

        assert_eq!(2, recordings.len());
        assert!(recordings.iter().all(|r| r.notification_id.is_none()));

        let events = recorder
            .select_events(&id, EventSelect::all())
            .await
            .expect("select should not fail");

        assert_eq!(
            vec![1, 2],
            events.iter().map(|e| e.originator_version).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn reused_versions_fail_and_insert_nothing() {
        let recorder = AggregateRecorder::new();
        let id = Uuid::new_v4();

        recorder
            .insert_events(vec![stored(id, 1)])
            .await
            .expect("the first insert should not fail");

        let err = recorder
            .insert_events(vec![stored(id, 2), stored(id, 1)])
            .await
            .expect_err("the reused version must fail the whole batch");

        assert!(matches!(
            err,
            InsertError::Integrity(IntegrityError::Version { .. })
        ));

        let events = recorder
            .select_events(&id, EventSelect::all())
            .await
            .expect("select should not fail");

        assert_eq!(1, events.len(), "the batch must not be partially applied");
    }

    #[tokio::test]
    async fn duplicates_within_one_batch_are_rejected() {
        let recorder = AggregateRecorder::new();
        let id = Uuid::new_v4();

        let err = recorder
            .insert_events(vec![stored(id, 1), stored(id, 1)])
            .await
            .expect_err("in-batch duplicates must fail");

        assert!(matches!(
            err,
            InsertError::Integrity(IntegrityError::Version { .. })
        ));
    }

    #[tokio::test]
    async fn select_honours_bounds_direction_and_limit() {
        let recorder = AggregateRecorder::new();
        let id = Uuid::new_v4();

        recorder
            .insert_events((1..=9).map(|v| stored(id, v)).collect())
            .await
            .expect("insert should not fail");

        let events = recorder
            .select_events(&id, EventSelect::all().gt(2).lte(7).desc().limit(3))
            .await
            .expect("select should not fail");

        assert_eq!(
            vec![7, 6, 5],
            events.iter().map(|e| e.originator_version).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn notification_ids_are_dense_and_ordered() {
        let recorder = ApplicationRecorder::new();

        for i in 1..=5u64 {
            recorder
                .insert_events(vec![stored(Uuid::new_v4(), i)])
                .await
                .expect("insert should not fail");
        }

        let notifications = recorder
            .select_notifications(1, 10, None, &[])
            .await
            .expect("select should not fail");

        assert_eq!(
            vec![1, 2, 3, 4, 5],
            notifications.iter().map(|n| n.id).collect::<Vec<_>>()
        );
        assert_eq!(Some(5), recorder.max_notification_id().await.unwrap());
    }

    #[tokio::test]
    async fn notifications_filter_by_stop_and_topics() {
        let recorder = ApplicationRecorder::new();

        recorder
            .insert_events(vec![
                stored_with_topic(Uuid::new_v4(), 1, "a:One"),
                stored_with_topic(Uuid::new_v4(), 1, "b:Two"),
                stored_with_topic(Uuid::new_v4(), 1, "a:One"),
                stored_with_topic(Uuid::new_v4(), 1, "b:Two"),
            ])
            .await
            .expect("insert should not fail");

        let stopped = recorder
            .select_notifications(1, 10, Some(2), &[])
            .await
            .expect("select should not fail");
        assert_eq!(vec![1, 2], stopped.iter().map(|n| n.id).collect::<Vec<_>>());

        let filtered = recorder
            .select_notifications(1, 10, None, &["a:One".to_owned()])
            .await
            .expect("select should not fail");
        assert_eq!(vec![1, 3], filtered.iter().map(|n| n.id).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn process_inserts_commit_events_and_tracking_atomically() {
        let recorder = ProcessRecorder::new();
        let id = Uuid::new_v4();

        recorder
            .insert_events_with_tracking(
                vec![stored(id, 1)],
                Some(Tracking::new("upstream", 21)),
            )
            .await
            .expect("the first insert should not fail");

        assert!(recorder.has_tracking_id("upstream", 21).await.unwrap());

        let err = recorder
            .insert_events_with_tracking(
                vec![stored(id, 2)],
                Some(Tracking::new("upstream", 21)),
            )
            .await
            .expect_err("the reused tracking pair must fail");

        assert!(matches!(
            err,
            InsertError::Integrity(IntegrityError::Tracking { .. })
        ));

        let events = recorder
            .select_events(&id, EventSelect::all())
            .await
            .expect("select should not fail");

        assert_eq!(
            vec![1],
            events.iter().map(|e| e.originator_version).collect::<Vec<_>>(),
            "the new event must not be visible after the tracking conflict"
        );
    }

    #[tokio::test]
    async fn tracking_is_recorded_exactly_once() {
        let recorder = TrackingRecorder::new();

        recorder
            .insert_tracking(Tracking::new("upstream", 1))
            .await
            .expect("the first insert should not fail");

        let err = recorder
            .insert_tracking(Tracking::new("upstream", 1))
            .await
            .expect_err("the duplicate must fail");

        assert!(matches!(
            err,
            InsertError::Integrity(IntegrityError::Tracking { .. })
        ));

        assert_eq!(
            Some(1),
            recorder.max_tracking_id("upstream").await.unwrap()
        );
        assert_eq!(None, recorder.max_tracking_id("other").await.unwrap());
        assert!(recorder.has_tracking_id("upstream", 1).await.unwrap());
        assert!(!recorder.has_tracking_id("upstream", 2).await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_once_the_tracking_record_appears() {
        let recorder = TrackingRecorder::new();
        let waiter = recorder.clone();

        let handle = tokio::spawn(async move {
            waiter
                .wait("upstream", 7, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        recorder
            .insert_tracking(Tracking::new("upstream", 7))
            .await
            .expect("insert should not fail");

        handle
            .await
            .expect("the waiter should not panic")
            .expect("the awaited record appeared");
    }

    #[tokio::test]
    async fn wait_times_out() {
        let recorder = TrackingRecorder::new();

        let err = recorder
            .wait("upstream", 7, Duration::from_millis(50))
            .await
            .expect_err("nothing was inserted");

        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[tokio::test]
    async fn subscriptions_catch_up_then_tail_then_stop() {
        let recorder = ApplicationRecorder::new();

        recorder
            .insert_events(vec![
                stored(Uuid::new_v4(), 1),
                stored(Uuid::new_v4(), 1),
                stored(Uuid::new_v4(), 1),
            ])
            .await
            .expect("insert should not fail");

        let mut subscription = recorder
            .subscribe(Some(0), &[])
            .await
            .expect("subscribe should not fail");

        for expected in 1..=3u64 {
            let notification = tokio::time::timeout(Duration::from_secs(1), subscription.next())
                .await
                .expect("catch-up should be prompt")
                .expect("the stream is live")
                .expect("the item is a notification");
            assert_eq!(expected, notification.id);
        }

        // Nothing more recorded yet; insert one and the tail must wake.
        recorder
            .insert_events(vec![stored(Uuid::new_v4(), 1)])
            .await
            .expect("insert should not fail");

        let notification = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("the live tail should wake within the poll bound")
            .expect("the stream is live")
            .expect("the item is a notification");
        assert_eq!(4, notification.id);

        subscription.stop();

        let end = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("stop should terminate the stream promptly");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn subscriptions_respect_gt_and_topic_filters() {
        let recorder = ProcessRecorder::new();

        recorder
            .insert_events(vec![
                stored_with_topic(Uuid::new_v4(), 1, "a:One"),
                stored_with_topic(Uuid::new_v4(), 1, "b:Two"),
                stored_with_topic(Uuid::new_v4(), 1, "a:One"),
            ])
            .await
            .expect("insert should not fail");

        let mut subscription = recorder
            .subscribe(Some(1), &["a:One".to_owned()])
            .await
            .expect("subscribe should not fail");

        let notification = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("catch-up should be prompt")
            .expect("the stream is live")
            .expect("the item is a notification");

        assert_eq!(3, notification.id, "ids 1 (gt) and 2 (topic) are skipped");
    }
}
