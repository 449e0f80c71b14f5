//! Module `transcoder` contains the bidirectional codec between the
//! structured payload of a Domain Event and the byte string recorded in
//! [`StoredEvent::state`][crate::event::StoredEvent].
//!
//! Payloads are modeled as a [`Value`] tree of basic scalars, ordered
//! sequences and string-keyed mappings. Types outside that set travel as
//! [`Value::Custom`] nodes, whose wire representation is produced by a
//! [`Transcoding`] adapter registered on the transcoder at construction
//! time.
//!
//! The default wire format is a UTF-8 JSON document (see
//! [`JsonTranscoder`]), where every adapter-produced value is an object
//! with exactly two keys: `_type_` (the adapter tag) and `_data_` (the
//! representation). Those two field names are reserved and rejected when
//! they appear in user mappings.
//!
//! Tuples are not a first-class wire type: ordered data round-trips as a
//! [`Value::Sequence`]. This is a limitation of the wire format, not of
//! the recorders.

pub mod json;

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

pub use self::json::JsonTranscoder;

/// Reserved wire key carrying the tag of an adapter-produced value.
pub const TYPE_KEY: &str = "_type_";

/// Reserved wire key carrying the representation of an adapter-produced value.
pub const DATA_KEY: &str = "_data_";

/// Built-in tag used to carry byte strings through the JSON wire format.
pub const BYTES_TAG: &str = "bytes";

/// Tag of the default UUID transcoding (32-character hex text).
pub const UUID_TAG: &str = "uuid_hex";

/// Tag of the default timestamp transcoding (ISO-8601 text).
pub const DATETIME_TAG: &str = "datetime_iso";

/// Tag of the default fixed-point decimal transcoding (decimal text).
pub const DECIMAL_TAG: &str = "decimal_str";

/// A structured domain-event payload: a tree of basic scalars, ordered
/// sequences, string-keyed mappings and tagged custom values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Integer(i64),
    /// A 64-bit floating point number. Non-finite values cannot be encoded.
    Float(f64),
    /// A UTF-8 string.
    Text(String),
    /// A byte string, carried on the wire through the reserved
    /// [`BYTES_TAG`] adapter form.
    Bytes(Vec<u8>),
    /// An ordered sequence of values.
    Sequence(Vec<Value>),
    /// A mapping with string keys. The keys [`TYPE_KEY`] and [`DATA_KEY`]
    /// are reserved and fail encoding.
    Mapping(BTreeMap<String, Value>),
    /// A value handled by a registered [`Transcoding`] adapter.
    Custom {
        /// The adapter tag, unique per registered transcoding.
        tag: String,
        /// The in-tree representation of the value, composed of
        /// already-encodable values.
        data: Box<Value>,
    },
}

impl Value {
    /// Returns a [`Value::Custom`] with the given tag and data.
    pub fn custom(tag: impl Into<String>, data: Value) -> Self {
        Value::Custom {
            tag: tag.into(),
            data: Box::new(data),
        }
    }

    /// Returns the custom value representing the given UUID,
    /// handled by the default [`UuidAsHex`] transcoding.
    pub fn uuid(id: Uuid) -> Self {
        Value::custom(UUID_TAG, Value::Text(id.simple().to_string()))
    }

    /// Returns the custom value representing the given timestamp,
    /// handled by the default [`DateTimeAsIso`] transcoding.
    pub fn datetime(at: DateTime<Utc>) -> Self {
        Value::custom(
            DATETIME_TAG,
            Value::Text(at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        )
    }

    /// Returns the custom value representing the given fixed-point
    /// decimal string, handled by the default [`DecimalAsText`]
    /// transcoding. The shape of the string is validated at encode time.
    pub fn decimal(repr: impl Into<String>) -> Self {
        Value::custom(DECIMAL_TAG, Value::Text(repr.into()))
    }

    /// Returns the inner boolean, if this is a [`Value::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the inner integer, if this is a [`Value::Integer`].
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the inner float, if this is a [`Value::Float`].
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the inner string slice, if this is a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the inner byte slice, if this is a [`Value::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the inner sequence, if this is a [`Value::Sequence`].
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the inner mapping, if this is a [`Value::Mapping`].
    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the UUID carried by this value, if it is a custom value
    /// produced by [`Value::uuid`].
    pub fn to_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Custom { tag, data } if tag == UUID_TAG => {
                data.as_text().and_then(|s| Uuid::try_parse(s).ok())
            }
            _ => None,
        }
    }

    /// Returns the timestamp carried by this value, if it is a custom
    /// value produced by [`Value::datetime`].
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Custom { tag, data } if tag == DATETIME_TAG => data
                .as_text()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Returns the decimal string carried by this value, if it is a
    /// custom value produced by [`Value::decimal`].
    pub fn as_decimal(&self) -> Option<&str> {
        match self {
            Value::Custom { tag, data } if tag == DECIMAL_TAG => data.as_text(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Sequence(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Mapping(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::uuid(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::datetime(value)
    }
}

/// All possible error types returned when encoding a [`Value`] tree.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    /// A [`Value::Custom`] node used a tag with no registered [`Transcoding`].
    #[error("no transcoding registered for tag '{tag}'")]
    UnsupportedType {
        /// The unregistered tag.
        tag: String,
    },

    /// A [`Value::Mapping`] used one of the reserved wire keys.
    #[error("mapping key '{key}' is reserved for the wire format")]
    ReservedKey {
        /// The offending key.
        key: String,
    },

    /// A [`Value::Float`] held a NaN or infinite number, which the wire
    /// format cannot represent.
    #[error("non-finite float cannot be encoded")]
    NonFiniteNumber,

    /// A registered [`Transcoding`] rejected the in-tree representation
    /// of a custom value.
    #[error("value for tag '{tag}' has unexpected shape: {reason}")]
    Invalid {
        /// The tag whose transcoding rejected the value.
        tag: String,
        /// Adapter-provided description of the mismatch.
        reason: String,
    },
}

/// All possible error types returned when decoding recorded bytes back
/// into a [`Value`] tree.
#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    /// The document contained an adapter form whose tag has no
    /// registered [`Transcoding`].
    #[error("unknown transcoding tag '{tag}'")]
    UnknownTag {
        /// The unknown tag.
        tag: String,
    },

    /// The document was not a valid wire document.
    #[error("malformed document: {message}")]
    Malformed {
        /// Description of the parse failure.
        message: String,
    },
}

impl DecodingError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        DecodingError::Malformed {
            message: message.into(),
        }
    }
}

/// A `Transcoder` serializes [`Value`] trees into the byte strings
/// recorded in [`StoredEvent::state`][crate::event::StoredEvent], and back.
///
/// Implementations must be safe to share across threads once configured.
pub trait Transcoder: Send + Sync {
    /// Serializes the given value tree into wire bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodingError>;

    /// Deserializes wire bytes back into a value tree.
    fn decode(&self, data: &[u8]) -> Result<Value, DecodingError>;
}

/// A type adapter registered on a [`Transcoder`], mapping the in-tree
/// representation of a [`Value::Custom`] to its wire representation.
///
/// Each adapter declares a unique string tag. The representation passed
/// in and out is composed of already-encodable values.
pub trait Transcoding: Send + Sync {
    /// The unique wire tag handled by this adapter.
    fn tag(&self) -> &'static str;

    /// Validates and converts the in-tree representation into its wire
    /// representation.
    fn encode(&self, data: &Value) -> Result<Value, EncodingError>;

    /// Validates and converts the wire representation back into the
    /// in-tree representation.
    fn decode(&self, data: Value) -> Result<Value, DecodingError>;
}

fn invalid(tag: &str, reason: impl Into<String>) -> EncodingError {
    EncodingError::Invalid {
        tag: tag.to_owned(),
        reason: reason.into(),
    }
}

/// Default transcoding for 128-bit UUIDs, represented on the wire as
/// 32-character lowercase hex text.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidAsHex;

impl Transcoding for UuidAsHex {
    fn tag(&self) -> &'static str {
        UUID_TAG
    }

    fn encode(&self, data: &Value) -> Result<Value, EncodingError> {
        let text = data
            .as_text()
            .ok_or_else(|| invalid(UUID_TAG, "expected text"))?;
        let id = Uuid::try_parse(text).map_err(|e| invalid(UUID_TAG, e.to_string()))?;
        Ok(Value::Text(id.simple().to_string()))
    }

    fn decode(&self, data: Value) -> Result<Value, DecodingError> {
        let text = data
            .as_text()
            .ok_or_else(|| DecodingError::malformed("uuid representation must be text"))?;
        let id = Uuid::try_parse(text)
            .map_err(|e| DecodingError::malformed(format!("invalid uuid: {e}")))?;
        Ok(Value::Text(id.simple().to_string()))
    }
}

/// Default transcoding for timestamps, represented on the wire as
/// ISO-8601 text with microsecond precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTimeAsIso;

impl Transcoding for DateTimeAsIso {
    fn tag(&self) -> &'static str {
        DATETIME_TAG
    }

    fn encode(&self, data: &Value) -> Result<Value, EncodingError> {
        let text = data
            .as_text()
            .ok_or_else(|| invalid(DATETIME_TAG, "expected text"))?;
        DateTime::parse_from_rfc3339(text).map_err(|e| invalid(DATETIME_TAG, e.to_string()))?;
        Ok(Value::Text(text.to_owned()))
    }

    fn decode(&self, data: Value) -> Result<Value, DecodingError> {
        match data {
            Value::Text(text) => {
                DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| DecodingError::malformed(format!("invalid timestamp: {e}")))?;
                Ok(Value::Text(text))
            }
            _ => Err(DecodingError::malformed(
                "timestamp representation must be text",
            )),
        }
    }
}

/// Default transcoding for fixed-point decimals, represented on the wire
/// as decimal text (optional sign, digits, optional fraction, optional
/// exponent). No floating-point round-trip is involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalAsText;

fn is_decimal_text(s: &str) -> bool {
    let mut chars = s.chars().peekable();

    if matches!(chars.peek(), Some('+' | '-')) {
        chars.next();
    }

    let mut digits = 0;
    while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
        chars.next();
        digits += 1;
    }

    if chars.peek() == Some(&'.') {
        chars.next();
        while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
            chars.next();
            digits += 1;
        }
    }

    if digits == 0 {
        return false;
    }

    if matches!(chars.peek(), Some('e' | 'E')) {
        chars.next();
        if matches!(chars.peek(), Some('+' | '-')) {
            chars.next();
        }
        let mut exponent_digits = 0;
        while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
            chars.next();
            exponent_digits += 1;
        }
        if exponent_digits == 0 {
            return false;
        }
    }

    chars.next().is_none()
}

impl Transcoding for DecimalAsText {
    fn tag(&self) -> &'static str {
        DECIMAL_TAG
    }

    fn encode(&self, data: &Value) -> Result<Value, EncodingError> {
        let text = data
            .as_text()
            .ok_or_else(|| invalid(DECIMAL_TAG, "expected text"))?;
        if !is_decimal_text(text) {
            return Err(invalid(DECIMAL_TAG, format!("'{text}' is not decimal")));
        }
        Ok(Value::Text(text.to_owned()))
    }

    fn decode(&self, data: Value) -> Result<Value, DecodingError> {
        match data {
            Value::Text(text) if is_decimal_text(&text) => Ok(Value::Text(text)),
            Value::Text(text) => Err(DecodingError::malformed(format!(
                "'{text}' is not decimal"
            ))),
            _ => Err(DecodingError::malformed(
                "decimal representation must be text",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_values_round_trip_through_the_helper_accessors() {
        let id = Uuid::new_v4();
        let value = Value::uuid(id);

        assert_eq!(Some(id), value.to_uuid());
        assert_eq!(None, value.to_datetime());
    }

    #[test]
    fn datetime_values_round_trip_through_the_helper_accessors() {
        let at = Utc::now();
        let value = Value::datetime(at);

        let round_tripped = value.to_datetime().expect("a timestamp should come back");
        assert_eq!(at.timestamp_micros(), round_tripped.timestamp_micros());
    }

    #[test]
    fn decimal_shapes_are_validated() {
        for valid in ["0", "-12.50", "+3.14159", "1e9", "2.5E-3", ".5"] {
            assert!(is_decimal_text(valid), "expected '{valid}' to be decimal");
        }

        for invalid in ["", "-", "1.2.3", "12,50", "abc", "1e", "."] {
            assert!(
                !is_decimal_text(invalid),
                "expected '{invalid}' to be rejected"
            );
        }
    }

    #[test]
    fn uuid_transcoding_rejects_non_text_representations() {
        let err = UuidAsHex
            .encode(&Value::Integer(7))
            .expect_err("integers are not uuid representations");

        assert!(matches!(err, EncodingError::Invalid { .. }));
    }
}
