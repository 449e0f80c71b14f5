//! Module `event` contains the units of recorded state shared by every
//! Recorder implementation: [`StoredEvent`], [`Notification`] and
//! [`Tracking`], together with the [`DomainEvent`] contract implemented
//! by user-defined event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transcoder::Value;
use crate::version::{NotificationId, Version};

/// Identifier of the sequence a recorded event belongs to,
/// typically the id of an Aggregate.
pub type OriginatorId = Uuid;

/// The universal unit of recorded state.
///
/// A `StoredEvent` is immutable after a successful insert: it is never
/// updated, and only administrative operations outside the library's
/// contract may physically delete it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// The id of the originator's sequence this event belongs to.
    pub originator_id: OriginatorId,

    /// The position of this event in the originator's sequence.
    pub originator_version: Version,

    /// Name of the concrete domain event type recorded in `state`,
    /// used by the [`Mapper`][crate::mapper::Mapper] to rebuild it.
    pub topic: String,

    /// The mapper's output: the serialized (and possibly compressed
    /// and/or encrypted) residual payload of the domain event.
    #[serde(with = "serde_bytes_base64")]
    pub state: Vec<u8>,
}

/// A [`StoredEvent`] positioned in the application sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The position of this event in the application sequence.
    ///
    /// Ids start at `1`, are unique, dense, and strictly increase
    /// in commit order.
    pub id: NotificationId,

    /// The id of the originator's sequence this event belongs to.
    pub originator_id: OriginatorId,

    /// The position of this event in the originator's sequence.
    pub originator_version: Version,

    /// Name of the concrete domain event type recorded in `state`.
    pub topic: String,

    /// The recorded state, as in [`StoredEvent::state`].
    #[serde(with = "serde_bytes_base64")]
    pub state: Vec<u8>,
}

impl From<Notification> for StoredEvent {
    fn from(notification: Notification) -> Self {
        StoredEvent {
            originator_id: notification.originator_id,
            originator_version: notification.originator_version,
            topic: notification.topic,
            state: notification.state,
        }
    }
}

/// A downstream processor's durable cursor: records that the named
/// consumer has processed the notification at the given position.
///
/// Tracking records are inserted atomically with whatever side-effects
/// the consumer derives from the notification, and are never updated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tracking {
    /// Name of the upstream application whose notification was processed.
    pub application_name: String,

    /// The processed position in the upstream application sequence.
    pub notification_id: NotificationId,
}

impl Tracking {
    /// Returns a new [`Tracking`] value for the given upstream
    /// application name and notification position.
    pub fn new(application_name: impl Into<String>, notification_id: NotificationId) -> Self {
        Self {
            application_name: application_name.into(),
            notification_id,
        }
    }
}

/// The outcome of recording a single event, returned by
/// [`insert_events`][crate::recorder::AggregateRecorder::insert_events]
/// in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    /// The id of the originator's sequence the event was recorded in.
    pub originator_id: OriginatorId,

    /// The recorded position in the originator's sequence.
    pub originator_version: Version,

    /// The assigned position in the application sequence, when the
    /// recorder maintains one. Aggregate-only recorders return `None`.
    pub notification_id: Option<NotificationId>,
}

/// The contract between user-defined domain event types and the
/// persistence core.
///
/// The library does not inspect an event beyond its originator id,
/// originator version and timestamp; everything else travels inside the
/// [`state`][DomainEvent::state] payload. Reconstruction goes through the
/// topic registry configured on the [`Mapper`][crate::mapper::Mapper],
/// not through this trait.
pub trait DomainEvent: Send + Sync {
    /// The id of the originator's sequence this event belongs to.
    fn originator_id(&self) -> OriginatorId;

    /// The position of this event in the originator's sequence.
    fn originator_version(&self) -> Version;

    /// The time the event occurred. Recorded as part of the state
    /// payload, not as a separate column.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Unique name of the concrete event type, e.g. `"cart:ItemAdded"`.
    fn topic(&self) -> &'static str;

    /// The residual payload of the event, excluding originator id and
    /// version (which are stored as dedicated columns).
    fn state(&self) -> Value;
}

mod serde_bytes_base64 {
    //! Serde helper keeping `state` readable in JSON-ish debug dumps
    //! while staying a plain byte vector in binary formats.

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            BASE64.decode(encoded).map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_converts_into_its_stored_event() {
        let notification = Notification {
            id: 42,
            originator_id: Uuid::new_v4(),
            originator_version: 7,
            topic: "test:Happened".to_owned(),
            state: b"{}".to_vec(),
        };

        let stored = StoredEvent::from(notification.clone());

        assert_eq!(stored.originator_id, notification.originator_id);
        assert_eq!(stored.originator_version, 7);
        assert_eq!(stored.topic, "test:Happened");
        assert_eq!(stored.state, b"{}".to_vec());
    }

    #[test]
    fn stored_event_round_trips_through_json() {
        let stored = StoredEvent {
            originator_id: Uuid::new_v4(),
            originator_version: 1,
            topic: "test:Happened".to_owned(),
            state: vec![0, 159, 146, 150],
        };

        let encoded = serde_json::to_string(&stored).expect("serialization should not fail");
        let decoded: StoredEvent =
            serde_json::from_str(&encoded).expect("deserialization should not fail");

        assert_eq!(stored, decoded);
    }
}
