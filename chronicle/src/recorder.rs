//! Module `recorder` contains the storage contracts at the heart of the
//! library: four recorder variants over a single persistence substrate,
//! with uniform atomicity, ordering and uniqueness guarantees.
//!
//! - [`AggregateRecorder`]: per-originator event sequences.
//! - [`ApplicationRecorder`]: adds the global application sequence of
//!   [`Notification`]s, with dense, commit-ordered ids, plus live
//!   subscriptions.
//! - [`TrackingRecorder`]: durable cursors of downstream consumers.
//! - [`ProcessRecorder`]: the join of application and tracking recorders,
//!   committing events and a tracking record in one transaction.
//!
//! All errors surface through the small taxonomy defined here; the
//! library retries nothing internally.

use std::time::Duration;

use async_trait::async_trait;

use crate::event::{Notification, OriginatorId, Recording, StoredEvent, Tracking};
use crate::subscription::Subscription;
use crate::version::{NotificationId, Version};

/// Bounds, direction and cap applied to
/// [`AggregateRecorder::select_events`].
///
/// Bounds filter first, then the direction is applied, then the limit:
/// `desc` with a `limit` returns the highest versions within the bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSelect {
    /// Strict lower bound on the originator version.
    pub gt: Option<Version>,
    /// Inclusive upper bound on the originator version.
    pub lte: Option<Version>,
    /// Return events in descending version order.
    pub desc: bool,
    /// Cap on the number of returned events; `None` means unbounded.
    pub limit: Option<usize>,
}

impl EventSelect {
    /// Selects the whole sequence in ascending order.
    pub fn all() -> Self {
        Self::default()
    }

    /// Sets a strict lower bound on the originator version.
    #[must_use]
    pub fn gt(mut self, version: Version) -> Self {
        self.gt = Some(version);
        self
    }

    /// Sets an inclusive upper bound on the originator version.
    #[must_use]
    pub fn lte(mut self, version: Version) -> Self {
        self.lte = Some(version);
        self
    }

    /// Returns events in descending version order.
    #[must_use]
    pub fn desc(mut self) -> Self {
        self.desc = true;
        self
    }

    /// Caps the number of returned events.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Uniqueness violations detected while recording. Recoverable by the
/// caller: reload the aggregate, or reposition the consumer.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// The `(originator_id, originator_version)` pair was already
    /// recorded. Nothing from the failing call was inserted.
    #[error("stored event version conflict: {detail}")]
    Version {
        /// Description of the conflicting pair.
        detail: String,
    },

    /// The `(application_name, notification_id)` pair was already
    /// tracked. Nothing from the failing call was inserted.
    #[error("tracking record conflict: {detail}")]
    Tracking {
        /// Description of the conflicting pair.
        detail: String,
    },
}

/// Transient infrastructure failures. May be retried by the caller,
/// with backoff.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The underlying storage was unreachable or misbehaved.
    #[error("storage transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// No connection could be acquired within the configured bounds.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A storage operation exceeded a configured timeout,
    /// e.g. the insertion lock timeout.
    #[error("storage operation timed out")]
    Timeout,
}

/// The chosen backing store does not support a requested operation.
/// Surfaced at construction or open time, never deferred to use time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// The recorder cannot tail the application sequence live,
    /// e.g. file-locked single-writer stores.
    #[error("this recorder does not support live subscriptions")]
    NoSubscribe,

    /// The datastore cannot run schema DDL, e.g. read-only deployments
    /// with externally managed tables.
    #[error("this datastore cannot manage its schema")]
    NoSchema,
}

/// All possible error types returned when inserting events or tracking
/// records.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    /// A uniqueness constraint was violated; see [`IntegrityError`].
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// The storage failed; see [`PersistenceError`].
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// All possible error types returned when opening a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The recorder does not support subscriptions.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// The storage failed while opening the subscription.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Error returned by [`TrackingRecorder::wait`] when the awaited
/// tracking record did not appear within the given duration.
#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for tracking record {application_name}#{notification_id} after {waited:?}")]
pub struct TimeoutError {
    /// The upstream application that was awaited.
    pub application_name: String,
    /// The notification position that was awaited.
    pub notification_id: NotificationId,
    /// How long the call waited before giving up.
    pub waited: Duration,
}

/// All possible error types returned by [`TrackingRecorder::wait`].
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The awaited tracking record did not appear in time.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The storage failed while polling.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Records and retrieves the event sequences of individual originators.
#[async_trait]
pub trait AggregateRecorder: Send + Sync {
    /// Records all given events in a single transaction.
    ///
    /// On success every event has been committed and, on recorders that
    /// maintain an application sequence, assigned a notification id.
    /// On failure nothing was inserted: a reused
    /// `(originator_id, originator_version)` pair fails the whole call
    /// with [`IntegrityError::Version`].
    ///
    /// Returns one [`Recording`] per event, in input order.
    async fn insert_events(
        &self,
        events: Vec<StoredEvent>,
    ) -> Result<Vec<Recording>, InsertError>;

    /// Returns the originator's events within the given bounds.
    ///
    /// Results are contiguous and monotonic in the originator version,
    /// ascending unless [`EventSelect::desc`] is set.
    async fn select_events(
        &self,
        originator_id: &OriginatorId,
        select: EventSelect,
    ) -> Result<Vec<StoredEvent>, PersistenceError>;
}

/// An [`AggregateRecorder`] that also maintains the global application
/// sequence and can be tailed live.
#[async_trait]
pub trait ApplicationRecorder: AggregateRecorder {
    /// Returns notifications with ids in `[start, stop]`, capped at
    /// `limit`, in strictly ascending id order.
    ///
    /// Density guarantee: no committed notification with an id between
    /// `start` and the last returned id is omitted, which together with
    /// the commit-order-equals-id-order invariant makes paging by
    /// "last seen id" safe for tailers.
    ///
    /// An empty `topics` slice selects all topics.
    async fn select_notifications(
        &self,
        start: NotificationId,
        limit: usize,
        stop: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Vec<Notification>, PersistenceError>;

    /// Returns the highest committed notification id, or `None` when
    /// the application sequence is empty.
    ///
    /// Because ids are assigned in commit order, the returned value is
    /// a safe high-water mark: no later commit can introduce a smaller
    /// id.
    async fn max_notification_id(&self) -> Result<Option<NotificationId>, PersistenceError>;

    /// Whether this recorder can serve [`subscribe`][ApplicationRecorder::subscribe].
    ///
    /// Checked by the event store at construction time so that
    /// [`CapabilityError::NoSubscribe`] surfaces before any iteration
    /// is attempted.
    fn supports_subscribe(&self) -> bool;

    /// Opens a live subscription yielding notifications with ids
    /// greater than `gt` (all of them when `None`), in strictly
    /// ascending order, exactly once, indefinitely.
    ///
    /// When no further events are recorded the subscription blocks
    /// until new events are committed. Administrative deletion of
    /// stored events under a live subscription is outside the
    /// contract.
    ///
    /// An empty `topics` slice selects all topics.
    async fn subscribe(
        &self,
        gt: Option<NotificationId>,
        topics: &[String],
    ) -> Result<Subscription, SubscribeError>;
}

/// Records the durable cursors of downstream consumers.
#[async_trait]
pub trait TrackingRecorder: Send + Sync {
    /// Inserts the given tracking record; a duplicate
    /// `(application_name, notification_id)` pair fails with
    /// [`IntegrityError::Tracking`].
    async fn insert_tracking(&self, tracking: Tracking) -> Result<(), InsertError>;

    /// Returns the highest notification id recorded for the named
    /// upstream application, or `None`.
    async fn max_tracking_id(
        &self,
        application_name: &str,
    ) -> Result<Option<NotificationId>, PersistenceError>;

    /// Returns whether the given position has been recorded for the
    /// named upstream application.
    async fn has_tracking_id(
        &self,
        application_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, PersistenceError>;

    /// Blocks until [`has_tracking_id`][TrackingRecorder::has_tracking_id]
    /// would return true, or fails with [`TimeoutError`] after the given
    /// duration. Used by callers bridging write-then-read flows.
    async fn wait(
        &self,
        application_name: &str,
        notification_id: NotificationId,
        timeout: Duration,
    ) -> Result<(), WaitError>;
}

/// The join of [`ApplicationRecorder`] and [`TrackingRecorder`]:
/// one transaction, both tables.
#[async_trait]
pub trait ProcessRecorder: ApplicationRecorder + TrackingRecorder {
    /// Records all given events and, when present, the tracking record,
    /// in one transaction.
    ///
    /// A duplicate tracking pair fails the whole call with
    /// [`IntegrityError::Tracking`] and none of the events become
    /// visible. With `tracking` absent this behaves exactly like
    /// [`insert_events`][AggregateRecorder::insert_events].
    async fn insert_events_with_tracking(
        &self,
        events: Vec<StoredEvent>,
        tracking: Option<Tracking>,
    ) -> Result<Vec<Recording>, InsertError>;
}
