//! Module `store` contains the [`EventStore`]: a thin, typed
//! composition of a [`Mapper`] and a recorder, exposing `put` and `get`
//! in domain terms plus a live subscription yielding
//! `(event, tracking)` pairs.
//!
//! The event store does not cache and does not batch across calls.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use crate::event::{DomainEvent, OriginatorId, Recording, StoredEvent, Tracking};
use crate::mapper::{Mapper, MapperError};
use crate::recorder::{
    AggregateRecorder, ApplicationRecorder, CapabilityError, EventSelect, InsertError,
    IntegrityError, PersistenceError, SubscribeError,
};
use crate::subscription::Subscription;
use crate::version::NotificationId;

/// All possible error types returned by [`EventStore::put`].
#[derive(Debug, thiserror::Error)]
pub enum PutError {
    /// An event in the batch could not be mapped; nothing was written.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// A uniqueness constraint failed; the whole batch failed, and the
    /// caller should reload the aggregate and retry.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// The storage failed; see [`PersistenceError`].
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<InsertError> for PutError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::Integrity(e) => PutError::Integrity(e),
            InsertError::Persistence(e) => PutError::Persistence(e),
        }
    }
}

/// All possible error types returned by [`EventStore::get`] and the
/// stream it produces.
#[derive(Debug, thiserror::Error)]
pub enum GetError {
    /// A recorded event could not be mapped back to a domain event.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// The storage failed; see [`PersistenceError`].
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// All possible error types yielded by an [`EventSubscription`].
#[derive(Debug, thiserror::Error)]
pub enum EventSubscriptionError {
    /// A recorded event could not be mapped back to a domain event.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// The underlying subscription failed; see [`PersistenceError`].
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Lazy stream of domain events returned by [`EventStore::get`],
/// demapped on demand in the recorder's order.
pub type EventStream<E> = BoxStream<'static, Result<E, GetError>>;

struct Inner<E, R> {
    application_name: String,
    mapper: Arc<Mapper<E>>,
    recorder: R,
}

/// Binds a [`Mapper`] to a recorder, exposing the persistence substrate
/// in domain terms. Cheap to clone; clones share the same mapper and
/// recorder.
pub struct EventStore<E, R> {
    inner: Arc<Inner<E, R>>,
}

impl<E, R> Clone for EventStore<E, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, R> fmt::Debug for EventStore<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("application_name", &self.inner.application_name)
            .finish()
    }
}

impl<E, R> EventStore<E, R>
where
    E: DomainEvent + 'static,
    R: AggregateRecorder + 'static,
{
    /// Returns an event store over the given recorder.
    ///
    /// The application name scopes the [`Tracking`] values produced by
    /// subscriptions; downstream consumers record their progress
    /// against it.
    pub fn new(application_name: impl Into<String>, mapper: Mapper<E>, recorder: R) -> Self {
        Self {
            inner: Arc::new(Inner {
                application_name: application_name.into(),
                mapper: Arc::new(mapper),
                recorder,
            }),
        }
    }

    /// Returns the name of the application this store records for.
    pub fn application_name(&self) -> &str {
        &self.inner.application_name
    }

    /// Returns the underlying recorder.
    pub fn recorder(&self) -> &R {
        &self.inner.recorder
    }

    /// Returns the configured mapper.
    pub fn mapper(&self) -> &Mapper<E> {
        &self.inner.mapper
    }

    /// Records the given events in one transaction.
    ///
    /// The whole batch is mapped before the recorder is touched: a
    /// mapping failure aborts the call with no partial writes. On
    /// [`PutError::Integrity`] the entire batch failed; reload the
    /// aggregate and retry.
    pub async fn put(&self, events: &[E]) -> Result<Vec<Recording>, PutError> {
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            stored.push(self.inner.mapper.to_stored(event)?);
        }

        tracing::trace!(
            application_name = %self.inner.application_name,
            events = stored.len(),
            "recording domain events"
        );

        Ok(self.inner.recorder.insert_events(stored).await?)
    }

    /// Returns the originator's events as a lazy stream, demapped on
    /// demand, in the recorder's order.
    pub async fn get(
        &self,
        originator_id: OriginatorId,
        select: EventSelect,
    ) -> Result<EventStream<E>, GetError> {
        let stored = self
            .inner
            .recorder
            .select_events(&originator_id, select)
            .await?;

        let mapper = Arc::clone(&self.inner.mapper);

        Ok(stream::iter(stored)
            .map(move |event| mapper.to_domain(&event).map_err(GetError::from))
            .boxed())
    }
}

impl<E, R> EventStore<E, R>
where
    E: DomainEvent + 'static,
    R: ApplicationRecorder + 'static,
{
    /// Returns an event store that is guaranteed to serve
    /// [`subscribe`][EventStore::subscribe].
    ///
    /// Fails with [`CapabilityError::NoSubscribe`] at construction time
    /// when the recorder cannot tail the application sequence, so the
    /// capability gap never surfaces mid-iteration.
    pub fn subscribing(
        application_name: impl Into<String>,
        mapper: Mapper<E>,
        recorder: R,
    ) -> Result<Self, CapabilityError> {
        if !recorder.supports_subscribe() {
            return Err(CapabilityError::NoSubscribe);
        }

        Ok(Self::new(application_name, mapper, recorder))
    }

    /// Opens a live subscription over the application sequence,
    /// yielding `(event, tracking)` pairs in ascending notification
    /// order, starting after `gt`.
    ///
    /// The tracking half names this store's application, ready to be
    /// persisted by a downstream
    /// [`ProcessRecorder`][crate::recorder::ProcessRecorder].
    pub async fn subscribe(
        &self,
        gt: Option<NotificationId>,
        topics: &[String],
    ) -> Result<EventSubscription<E>, SubscribeError> {
        let subscription = self.inner.recorder.subscribe(gt, topics).await?;

        tracing::debug!(
            application_name = %self.inner.application_name,
            gt = ?gt,
            topics = ?topics,
            "opened event subscription"
        );

        Ok(EventSubscription {
            subscription,
            mapper: Arc::clone(&self.inner.mapper),
            application_name: self.inner.application_name.clone(),
        })
    }
}

/// A live subscription at the event-store level: the recorder's
/// [`Subscription`] with demapping applied, yielding the domain event
/// together with the [`Tracking`] value a consumer should persist
/// atomically with its side-effects.
pub struct EventSubscription<E> {
    subscription: Subscription,
    mapper: Arc<Mapper<E>>,
    application_name: String,
}

impl<E> EventSubscription<E>
where
    E: DomainEvent,
{
    /// Returns the next `(event, tracking)` pair, blocking until one is
    /// committed. Returns `None` once the subscription has terminated.
    pub async fn next(&mut self) -> Option<Result<(E, Tracking), EventSubscriptionError>> {
        let item = self.subscription.next().await?;

        Some(item.map_err(EventSubscriptionError::from).and_then(
            |notification| {
                let tracking = Tracking::new(self.application_name.clone(), notification.id);
                let stored = StoredEvent::from(notification);
                let event = self.mapper.to_domain(&stored)?;
                Ok((event, tracking))
            },
        ))
    }

    /// Stops the subscription. Idempotent and non-blocking.
    pub fn stop(&self) {
        self.subscription.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::TryStreamExt;
    use uuid::Uuid;

    use super::*;
    use crate::inmemory;
    use crate::mapper::tests::{cart_mapper, CartEvent};

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = EventStore::new(
            "carts",
            cart_mapper(),
            inmemory::ApplicationRecorder::new(),
        );
        let cart_id = Uuid::new_v4();

        let recordings = store
            .put(&[
                CartEvent::item_added(cart_id, 1, "SKU-1"),
                CartEvent::item_added(cart_id, 2, "SKU-2"),
            ])
            .await
            .expect("put should not fail");

        assert_eq!(vec![Some(1), Some(2)], recordings
            .iter()
            .map(|r| r.notification_id)
            .collect::<Vec<_>>());

        let events: Vec<CartEvent> = store
            .get(cart_id, EventSelect::all())
            .await
            .expect("get should not fail")
            .try_collect()
            .await
            .expect("demapping should not fail");

        assert_eq!(2, events.len());
        assert_eq!(cart_id, events[0].originator_id());
    }

    #[tokio::test]
    async fn version_conflicts_fail_the_whole_batch() {
        let store = EventStore::new(
            "carts",
            cart_mapper(),
            inmemory::ApplicationRecorder::new(),
        );
        let cart_id = Uuid::new_v4();

        store
            .put(&[CartEvent::item_added(cart_id, 1, "SKU-1")])
            .await
            .expect("the first put should not fail");

        let err = store
            .put(&[CartEvent::item_added(cart_id, 1, "SKU-1")])
            .await
            .expect_err("the reused version must fail");

        assert!(matches!(err, PutError::Integrity(_)));
    }

    #[tokio::test]
    async fn subscribing_construction_requires_the_capability() {
        let store = EventStore::subscribing(
            "carts",
            cart_mapper(),
            inmemory::ProcessRecorder::new(),
        )
        .expect("the in-memory recorder supports subscriptions");

        let mut subscription = store
            .subscribe(None, &[])
            .await
            .expect("subscribe should not fail");

        let cart_id = Uuid::new_v4();
        store
            .put(&[CartEvent::item_added(cart_id, 1, "SKU-1")])
            .await
            .expect("put should not fail");

        let (event, tracking) = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("the subscription should wake promptly")
            .expect("the stream is live")
            .expect("the item should demap");

        assert_eq!(cart_id, event.originator_id());
        assert_eq!(Tracking::new("carts", 1), tracking);

        subscription.stop();
    }
}
