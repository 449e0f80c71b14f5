//! Module `projection` contains the [`ProjectionRunner`]: a worker that
//! drives a user-supplied [`Projection`] over an application
//! subscription while the projection keeps a durable cursor.
//!
//! The exactly-once recipe: the projection persists its side-effects
//! atomically with the [`Tracking`] record, through a tracking- or
//! process-recorder it controls. A crash between processing and commit
//! replays the event on restart; the uniqueness constraint on tracking
//! makes the retry fail fast with
//! [`IntegrityError::Tracking`], which the runner treats as
//! "already done" and skips. At-least-once delivery plus at-most-once
//! side-effects is effectively exactly-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::event::{DomainEvent, Tracking};
use crate::recorder::{
    ApplicationRecorder, InsertError, IntegrityError, PersistenceError, SubscribeError,
};
use crate::store::{EventStore, EventSubscriptionError};
use crate::version::NotificationId;

/// All possible error types returned by
/// [`Projection::process_event`].
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// A uniqueness constraint failed in the projection's recorder.
    ///
    /// [`IntegrityError::Tracking`] is the idempotent-replay signal and
    /// is skipped by the runner; anything else is fatal for the worker.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// The projection's storage failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The projection failed for a domain-specific reason.
    #[error("projection failed to process event: {0}")]
    Other(#[source] anyhow::Error),
}

impl From<InsertError> for ProjectionError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::Integrity(e) => ProjectionError::Integrity(e),
            InsertError::Persistence(e) => ProjectionError::Persistence(e),
        }
    }
}

/// User code consuming a subscription and updating a read model
/// atomically with its tracking cursor.
#[async_trait]
pub trait Projection<E>: Send + Sync
where
    E: DomainEvent,
{
    /// Name of this projection, used for log scoping and derived
    /// storage names.
    fn name(&self) -> &str;

    /// Optional topic filter applied to the subscription. An empty
    /// vector selects all topics.
    fn topics(&self) -> Vec<String> {
        Vec::new()
    }

    /// Returns the highest notification id this projection has
    /// processed for the named upstream application, read from the
    /// tracking recorder the projection controls.
    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError>;

    /// Processes one event.
    ///
    /// Must be idempotent with respect to re-delivery of `tracking`,
    /// and must persist any side-effects atomically with the tracking
    /// record.
    async fn process_event(&self, event: E, tracking: Tracking) -> Result<(), ProjectionError>;
}

/// All possible error types returned by [`ProjectionRunner::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// Reading the projection's cursor failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Opening the upstream subscription failed.
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

/// All possible error types surfaced by
/// [`ProjectionRunner::run_forever`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The projection failed while processing an event.
    #[error("projection '{name}' failed: {source}")]
    Projection {
        /// Name of the failing projection.
        name: String,
        /// The error the projection returned.
        #[source]
        source: ProjectionError,
    },

    /// The upstream subscription failed.
    #[error("subscription failed: {0}")]
    Subscription(#[source] EventSubscriptionError),

    /// The worker task panicked.
    #[error("projection worker panicked: {0}")]
    Panicked(String),
}

/// Remote stop switch for a running [`ProjectionRunner`], usable while
/// another task blocks in [`run_forever`][ProjectionRunner::run_forever].
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Stops the runner. Idempotent and non-blocking.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Drives a [`Projection`] over an upstream subscription on a dedicated
/// worker task, recovering the cursor on start and surfacing worker
/// errors through [`run_forever`][ProjectionRunner::run_forever].
///
/// Dropping the runner stops the worker and releases the subscription.
pub struct ProjectionRunner {
    worker: Option<JoinHandle<Result<(), RunnerError>>>,
    stop: Arc<watch::Sender<bool>>,
}

impl ProjectionRunner {
    /// Recovers the projection's cursor, opens the upstream
    /// subscription after it, and starts the worker.
    pub async fn start<E, R, P>(
        store: &EventStore<E, R>,
        projection: Arc<P>,
    ) -> Result<Self, StartError>
    where
        E: DomainEvent + 'static,
        R: ApplicationRecorder + 'static,
        P: Projection<E> + 'static,
    {
        let upstream = store.application_name().to_owned();
        let cursor = projection.max_tracking_id(&upstream).await?;
        let topics = projection.topics();
        let mut subscription = store.subscribe(cursor, &topics).await?;

        tracing::debug!(
            projection = projection.name(),
            upstream = %upstream,
            cursor = ?cursor,
            "starting projection runner"
        );

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let name = projection.name().to_owned();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = async {
                        while !*stop_rx.borrow() {
                            if stop_rx.changed().await.is_err() {
                                break;
                            }
                        }
                    } => {
                        subscription.stop();
                        return Ok(());
                    }
                    item = subscription.next() => match item {
                        None => return Ok(()),
                        Some(Err(err)) => {
                            subscription.stop();
                            tracing::error!(projection = %name, error = %err, "subscription failed");
                            return Err(RunnerError::Subscription(err));
                        }
                        Some(Ok((event, tracking))) => {
                            let position = tracking.notification_id;
                            match projection.process_event(event, tracking).await {
                                Ok(()) => {
                                    tracing::trace!(
                                        projection = %name,
                                        notification_id = position,
                                        "processed event"
                                    );
                                }
                                Err(ProjectionError::Integrity(IntegrityError::Tracking { .. })) => {
                                    tracing::debug!(
                                        projection = %name,
                                        notification_id = position,
                                        "notification already tracked, skipping"
                                    );
                                }
                                Err(err) => {
                                    subscription.stop();
                                    tracing::error!(
                                        projection = %name,
                                        notification_id = position,
                                        error = %err,
                                        "projection failed"
                                    );
                                    return Err(RunnerError::Projection { name, source: err });
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            worker: Some(worker),
            stop: Arc::new(stop_tx),
        })
    }

    /// Stops the worker. Idempotent and non-blocking; a concurrent
    /// [`run_forever`][ProjectionRunner::run_forever] call returns `Ok`
    /// promptly.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Returns a stop switch usable from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Blocks until the worker errors (returning the error), the given
    /// timeout elapses (returning `Ok` with the worker still running),
    /// or [`stop`][ProjectionRunner::stop] is invoked (returning `Ok`).
    pub async fn run_forever(&mut self, timeout: Option<Duration>) -> Result<(), RunnerError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };

        let joined = match timeout {
            None => worker.await,
            Some(limit) => match tokio::time::timeout(limit, &mut *worker).await {
                Err(_elapsed) => return Ok(()),
                Ok(joined) => joined,
            },
        };

        self.worker = None;

        match joined {
            Ok(outcome) => outcome,
            Err(join_err) => Err(RunnerError::Panicked(join_err.to_string())),
        }
    }
}

impl Drop for ProjectionRunner {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use anyhow::anyhow;
    use uuid::Uuid;

    use super::*;
    use crate::inmemory;
    use crate::mapper::tests::{cart_mapper, CartEvent};
    use crate::recorder::TrackingRecorder as _;

    struct CountingProjection {
        view: inmemory::TrackingRecorder,
        processed: AtomicU64,
        recover_cursor: bool,
        fail: bool,
    }

    impl CountingProjection {
        fn new() -> Self {
            Self {
                view: inmemory::TrackingRecorder::new(),
                processed: AtomicU64::new(0),
                recover_cursor: true,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Projection<CartEvent> for CountingProjection {
        fn name(&self) -> &str {
            "cart-counts"
        }

        async fn max_tracking_id(
            &self,
            application_name: &str,
        ) -> Result<Option<NotificationId>, PersistenceError> {
            if !self.recover_cursor {
                return Ok(None);
            }
            self.view.max_tracking_id(application_name).await
        }

        async fn process_event(
            &self,
            _event: CartEvent,
            tracking: Tracking,
        ) -> Result<(), ProjectionError> {
            if self.fail {
                return Err(ProjectionError::Other(anyhow!("read model unavailable")));
            }

            self.view.insert_tracking(tracking).await?;
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn cart_store() -> EventStore<CartEvent, inmemory::ApplicationRecorder> {
        EventStore::subscribing("carts", cart_mapper(), inmemory::ApplicationRecorder::new())
            .expect("the in-memory recorder supports subscriptions")
    }

    async fn put_item(store: &EventStore<CartEvent, inmemory::ApplicationRecorder>, version: u64) {
        store
            .put(&[CartEvent::item_added(Uuid::new_v4(), version, "SKU-1")])
            .await
            .expect("put should not fail");
    }

    #[tokio::test]
    async fn the_runner_processes_catchup_and_live_events() {
        let store = cart_store();
        put_item(&store, 1).await;
        put_item(&store, 1).await;

        let projection = Arc::new(CountingProjection::new());
        let mut runner = ProjectionRunner::start(&store, Arc::clone(&projection))
            .await
            .expect("the runner should start");

        put_item(&store, 1).await;

        projection
            .view
            .wait("carts", 3, Duration::from_secs(2))
            .await
            .expect("all three notifications should be tracked");

        assert_eq!(3, projection.processed.load(Ordering::SeqCst));

        runner.stop();
        runner
            .run_forever(None)
            .await
            .expect("a stopped runner reports no error");
    }

    #[tokio::test]
    async fn already_tracked_notifications_are_skipped() {
        let store = cart_store();
        put_item(&store, 1).await;
        put_item(&store, 1).await;

        let mut projection = CountingProjection::new();
        projection.recover_cursor = false;
        let projection = Arc::new(projection);

        // The first notification was already processed by a previous
        // incarnation; replaying it must not fail the worker.
        projection
            .view
            .insert_tracking(Tracking::new("carts", 1))
            .await
            .expect("insert should not fail");

        let mut runner = ProjectionRunner::start(&store, Arc::clone(&projection))
            .await
            .expect("the runner should start");

        projection
            .view
            .wait("carts", 2, Duration::from_secs(2))
            .await
            .expect("the second notification should be tracked");

        assert_eq!(1, projection.processed.load(Ordering::SeqCst));

        runner.stop();
        runner
            .run_forever(None)
            .await
            .expect("a stopped runner reports no error");
    }

    #[tokio::test]
    async fn projection_failures_surface_from_run_forever() {
        let store = cart_store();
        put_item(&store, 1).await;

        let mut projection = CountingProjection::new();
        projection.fail = true;
        let projection = Arc::new(projection);

        let mut runner = ProjectionRunner::start(&store, projection)
            .await
            .expect("the runner should start");

        let err = runner
            .run_forever(Some(Duration::from_secs(2)))
            .await
            .expect_err("the failing projection must surface");

        assert!(matches!(err, RunnerError::Projection { name, .. } if name == "cart-counts"));
    }

    #[tokio::test]
    async fn run_forever_returns_on_timeout_with_the_worker_still_running() {
        let store = cart_store();

        let mut runner = ProjectionRunner::start(&store, Arc::new(CountingProjection::new()))
            .await
            .expect("the runner should start");

        runner
            .run_forever(Some(Duration::from_millis(50)))
            .await
            .expect("a timeout is not an error");

        runner.stop();
        runner
            .run_forever(None)
            .await
            .expect("a stopped runner reports no error");
    }
}
