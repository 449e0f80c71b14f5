//! Contains the [`Subscription`] type returned by
//! [`ApplicationRecorder::subscribe`][crate::recorder::ApplicationRecorder::subscribe]:
//! an ordered, blocking iteration over the growing application sequence,
//! with catch-up and live-tail semantics.
//!
//! Recorder implementations obtain the producing half through
//! [`channel`] and drive it from a spawned task; the consuming half is
//! handed to the application. Stopping is prompt and idempotent, and
//! dropping the subscription releases the driver and its resources on
//! any exit path.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};

use crate::event::Notification;
use crate::recorder::PersistenceError;

/// Buffer size of the channel between a subscription driver and its
/// consumer.
pub const SUBSCRIPTION_BUFFER: usize = 128;

/// Bound on how long a driver may sleep before re-checking for new
/// events or a stop signal. Push notifications wake drivers earlier;
/// this is the polling fallback.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Returns a connected `(Feed, Subscription)` pair.
///
/// Used by recorder implementations: the driver task owns the [`Feed`]
/// and delivers notifications in ascending id order; the caller owns the
/// [`Subscription`].
pub fn channel(buffer: usize) -> (Feed, Subscription) {
    let (tx, rx) = mpsc::channel(buffer);
    let (stop_tx, stop_rx) = watch::channel(false);

    (
        Feed { tx, stop: stop_rx },
        Subscription { rx, stop: stop_tx },
    )
}

/// Marker returned by [`Feed`] methods when the subscription was
/// stopped or dropped and the driver should terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// The producing half of a subscription, owned by a recorder's driver
/// task.
#[derive(Debug)]
pub struct Feed {
    tx: mpsc::Sender<Result<Notification, PersistenceError>>,
    stop: watch::Receiver<bool>,
}

impl Feed {
    /// Delivers the next item to the consumer, applying backpressure
    /// when the consumer lags behind.
    ///
    /// Returns [`Stopped`] when the subscription was stopped or dropped
    /// while delivering.
    pub async fn deliver(
        &mut self,
        item: Result<Notification, PersistenceError>,
    ) -> Result<(), Stopped> {
        tokio::select! {
            biased;
            () = stop_signal(&mut self.stop) => Err(Stopped),
            sent = self.tx.send(item) => sent.map_err(|_| Stopped),
        }
    }

    /// Returns whether the subscription was already stopped.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves when the subscription is stopped or dropped. Intended
    /// for use inside a driver's idle `select!`.
    pub async fn stopped(&mut self) {
        stop_signal(&mut self.stop).await;
    }
}

async fn stop_signal(stop: &mut watch::Receiver<bool>) {
    // Either an explicit stop() or the Subscription being dropped
    // (which closes the watch channel) terminates the driver.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// A scoped, live iteration over the application sequence.
///
/// Yields notifications in strictly ascending id order, exactly once.
/// When no more recorded events are available, [`next`][Subscription::next]
/// blocks until new events are committed. Iteration terminates promptly
/// after [`stop`][Subscription::stop], and dropping the subscription
/// stops it as well.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Result<Notification, PersistenceError>>,
    stop: watch::Sender<bool>,
}

impl Subscription {
    /// Returns the next notification, blocking until one is committed.
    ///
    /// Returns `None` once the subscription has terminated, whether by
    /// [`stop`][Subscription::stop] or by a fatal driver error already
    /// yielded as an `Err` item.
    pub async fn next(&mut self) -> Option<Result<Notification, PersistenceError>> {
        self.rx.recv().await
    }

    /// Stops the subscription. Idempotent and non-blocking; a blocked
    /// [`next`][Subscription::next] call observes the end of the stream
    /// within one poll interval.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Stream for Subscription {
    type Item = Result<Notification, PersistenceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn notification(id: u64) -> Notification {
        Notification {
            id,
            originator_id: Uuid::new_v4(),
            originator_version: 1,
            topic: "test:Happened".to_owned(),
            state: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn items_flow_from_feed_to_subscription() {
        let (mut feed, mut subscription) = channel(8);

        feed.deliver(Ok(notification(1)))
            .await
            .expect("the subscription is live");

        let received = subscription
            .next()
            .await
            .expect("an item was delivered")
            .expect("the item is a notification");

        assert_eq!(1, received.id);
    }

    #[tokio::test]
    async fn stop_terminates_a_pending_driver() {
        let (mut feed, subscription) = channel(8);

        subscription.stop();
        subscription.stop(); // idempotent

        let err = feed
            .deliver(Ok(notification(1)))
            .await
            .expect_err("the driver must observe the stop");

        assert_eq!(Stopped, err);
        assert!(feed.is_stopped());
    }

    #[tokio::test]
    async fn dropping_the_subscription_stops_the_driver() {
        let (mut feed, subscription) = channel(1);
        drop(subscription);

        let err = feed
            .deliver(Ok(notification(1)))
            .await
            .expect_err("the driver must observe the drop");

        assert_eq!(Stopped, err);
    }

    #[tokio::test]
    async fn next_returns_none_after_the_driver_is_gone() {
        let (feed, mut subscription) = channel(8);
        drop(feed);

        assert!(subscription.next().await.is_none());
    }
}
