//! Contains the types used to position recorded events in their sequences.

/// The position of a recorded event within its originator's sequence.
///
/// Versions are assigned by the originator (typically an Aggregate) and
/// increase by one for each new event. The pair `(originator_id, version)`
/// is unique in every Recorder implementation, which is what makes
/// optimistic concurrency checks possible: a concurrent writer reusing a
/// version fails with [`IntegrityError::Version`][crate::recorder::IntegrityError].
pub type Version = u64;

/// The position of a recorded event within the application sequence.
///
/// Notification ids are assigned by Application and Process Recorders,
/// start at `1`, are dense (no committed gaps) and strictly increase in
/// commit order. See the [`recorder`][crate::recorder] module documentation
/// for the ordering guarantees attached to this type.
pub type NotificationId = u64;
