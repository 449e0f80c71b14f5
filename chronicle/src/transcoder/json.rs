//! Contains the default [`Transcoder`] implementation, producing UTF-8
//! JSON wire documents via the [serde_json] crate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::transcoder::{
    DateTimeAsIso, DecimalAsText, DecodingError, EncodingError, Transcoder, Transcoding,
    UuidAsHex, Value, BYTES_TAG, DATA_KEY, TYPE_KEY,
};

/// [`Transcoder`] implementation producing UTF-8 JSON documents.
///
/// Adapter-produced values are serialized as two-key objects
/// `{"_type_": tag, "_data_": representation}`. Byte strings use the
/// reserved built-in tag [`BYTES_TAG`] with a base64 representation;
/// registering an adapter under that tag has no effect on decoding.
///
/// The default constructor registers the [`UuidAsHex`], [`DateTimeAsIso`]
/// and [`DecimalAsText`] transcodings. Use [`JsonTranscoder::empty`] to
/// start from a blank registry.
pub struct JsonTranscoder {
    transcodings: HashMap<&'static str, Arc<dyn Transcoding>>,
}

impl Default for JsonTranscoder {
    fn default() -> Self {
        let mut transcoder = Self::empty();
        transcoder
            .register(UuidAsHex)
            .register(DateTimeAsIso)
            .register(DecimalAsText);
        transcoder
    }
}

impl JsonTranscoder {
    /// Returns a transcoder with no registered transcodings.
    pub fn empty() -> Self {
        Self {
            transcodings: HashMap::new(),
        }
    }

    /// Registers a [`Transcoding`] adapter, replacing any previously
    /// registered adapter with the same tag.
    pub fn register(&mut self, transcoding: impl Transcoding + 'static) -> &mut Self {
        self.transcodings
            .insert(transcoding.tag(), Arc::new(transcoding));
        self
    }

    fn transcoding(&self, tag: &str) -> Option<&Arc<dyn Transcoding>> {
        self.transcodings.get(tag)
    }

    fn to_json(&self, value: &Value) -> Result<serde_json::Value, EncodingError> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or(EncodingError::NonFiniteNumber)?,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => wire_form(BYTES_TAG, serde_json::Value::String(BASE64.encode(b))),
            Value::Sequence(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.to_json(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Mapping(entries) => {
                let mut object = serde_json::Map::with_capacity(entries.len());
                for (key, entry) in entries {
                    if key == TYPE_KEY || key == DATA_KEY {
                        return Err(EncodingError::ReservedKey { key: key.clone() });
                    }
                    object.insert(key.clone(), self.to_json(entry)?);
                }
                serde_json::Value::Object(object)
            }
            Value::Custom { tag, data } => {
                let transcoding =
                    self.transcoding(tag)
                        .ok_or_else(|| EncodingError::UnsupportedType {
                            tag: tag.clone(),
                        })?;
                let representation = transcoding.encode(data)?;
                wire_form(tag, self.to_json(&representation)?)
            }
        })
    }

    fn from_json(&self, value: serde_json::Value) -> Result<Value, DecodingError> {
        Ok(match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().ok_or_else(|| {
                    DecodingError::malformed(format!("number {n} is out of range"))
                })?),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => Value::Sequence(
                items
                    .into_iter()
                    .map(|item| self.from_json(item))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(mut object) => {
                if object.len() == 2 && object.contains_key(TYPE_KEY) {
                    let tag = match object.remove(TYPE_KEY) {
                        Some(serde_json::Value::String(tag)) => tag,
                        _ => {
                            return Err(DecodingError::malformed(format!(
                                "'{TYPE_KEY}' must be a string"
                            )))
                        }
                    };
                    let data = object.remove(DATA_KEY).ok_or_else(|| {
                        DecodingError::malformed(format!(
                            "adapter form for tag '{tag}' is missing '{DATA_KEY}'"
                        ))
                    })?;

                    return self.decode_custom(tag, data);
                }

                let mut entries = BTreeMap::new();
                for (key, entry) in object {
                    entries.insert(key, self.from_json(entry)?);
                }
                Value::Mapping(entries)
            }
        })
    }

    fn decode_custom(&self, tag: String, data: serde_json::Value) -> Result<Value, DecodingError> {
        if tag == BYTES_TAG {
            let encoded = match data {
                serde_json::Value::String(s) => s,
                _ => {
                    return Err(DecodingError::malformed(
                        "bytes representation must be a base64 string",
                    ))
                }
            };
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| DecodingError::malformed(format!("invalid base64: {e}")))?;
            return Ok(Value::Bytes(bytes));
        }

        let transcoding = self
            .transcoding(&tag)
            .ok_or_else(|| DecodingError::UnknownTag { tag: tag.clone() })?;

        let representation = self.from_json(data)?;
        let decoded = transcoding.decode(representation)?;

        Ok(Value::Custom {
            tag,
            data: Box::new(decoded),
        })
    }
}

fn wire_form(tag: &str, data: serde_json::Value) -> serde_json::Value {
    let mut object = serde_json::Map::with_capacity(2);
    object.insert(TYPE_KEY.to_owned(), serde_json::Value::String(tag.to_owned()));
    object.insert(DATA_KEY.to_owned(), data);
    serde_json::Value::Object(object)
}

impl Transcoder for JsonTranscoder {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodingError> {
        let document = self.to_json(value)?;
        Ok(serde_json::to_vec(&document).expect("json serialization should not fail"))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, DecodingError> {
        let document: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| DecodingError::malformed(e.to_string()))?;
        self.from_json(document)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn sample_tree() -> Value {
        let mut mapping = BTreeMap::new();
        mapping.insert("null".to_owned(), Value::Null);
        mapping.insert("flag".to_owned(), Value::Bool(true));
        mapping.insert("count".to_owned(), Value::Integer(-42));
        mapping.insert("ratio".to_owned(), Value::Float(0.5));
        mapping.insert("name".to_owned(), Value::Text("order".to_owned()));
        mapping.insert("raw".to_owned(), Value::Bytes(vec![1, 2, 3, 255]));
        mapping.insert(
            "items".to_owned(),
            Value::Sequence(vec![Value::Integer(1), Value::Text("two".to_owned())]),
        );
        mapping.insert("id".to_owned(), Value::uuid(Uuid::new_v4()));
        mapping.insert("at".to_owned(), Value::datetime(Utc::now()));
        mapping.insert("total".to_owned(), Value::decimal("99.90"));
        Value::Mapping(mapping)
    }

    #[test]
    fn value_trees_round_trip() {
        let transcoder = JsonTranscoder::default();
        let tree = sample_tree();

        let encoded = transcoder.encode(&tree).expect("encoding should not fail");
        let decoded = transcoder.decode(&encoded).expect("decoding should not fail");

        assert_eq!(tree, decoded);
    }

    #[test]
    fn adapter_values_use_the_two_key_wire_form() {
        let transcoder = JsonTranscoder::default();
        let id = Uuid::new_v4();

        let encoded = transcoder
            .encode(&Value::uuid(id))
            .expect("encoding should not fail");
        let document: serde_json::Value =
            serde_json::from_slice(&encoded).expect("wire documents are valid json");

        assert_eq!(
            document[TYPE_KEY],
            serde_json::Value::String("uuid_hex".to_owned())
        );
        assert_eq!(
            document[DATA_KEY],
            serde_json::Value::String(id.simple().to_string())
        );
    }

    #[test]
    fn unregistered_tags_fail_encoding() {
        let transcoder = JsonTranscoder::default();
        let value = Value::custom("money", Value::Text("12.50 EUR".to_owned()));

        let err = transcoder
            .encode(&value)
            .expect_err("unregistered tags must not encode");

        assert!(matches!(
            err,
            EncodingError::UnsupportedType { tag } if tag == "money"
        ));
    }

    #[test]
    fn unknown_tags_fail_decoding() {
        let transcoder = JsonTranscoder::default();
        let document = br#"{"_type_":"money","_data_":"12.50 EUR"}"#;

        let err = transcoder
            .decode(document)
            .expect_err("unknown tags must not decode");

        assert!(matches!(
            err,
            DecodingError::UnknownTag { tag } if tag == "money"
        ));
    }

    #[test]
    fn reserved_keys_are_rejected_in_user_mappings() {
        let transcoder = JsonTranscoder::default();
        let mut mapping = BTreeMap::new();
        mapping.insert(TYPE_KEY.to_owned(), Value::Text("oops".to_owned()));
        mapping.insert("other".to_owned(), Value::Null);

        let err = transcoder
            .encode(&Value::Mapping(mapping))
            .expect_err("reserved keys must be rejected");

        assert!(matches!(err, EncodingError::ReservedKey { key } if key == TYPE_KEY));
    }

    #[test]
    fn garbage_bytes_fail_decoding_as_malformed() {
        let transcoder = JsonTranscoder::default();

        let err = transcoder
            .decode(b"\xff\xfe not json")
            .expect_err("garbage must not decode");

        assert!(matches!(err, DecodingError::Malformed { .. }));
    }

    #[test]
    fn non_finite_floats_fail_encoding() {
        let transcoder = JsonTranscoder::default();

        let err = transcoder
            .encode(&Value::Float(f64::NAN))
            .expect_err("NaN cannot be represented on the wire");

        assert!(matches!(err, EncodingError::NonFiniteNumber));
    }

    #[test]
    fn user_transcodings_extend_the_registry() {
        struct MoneyAsText;

        impl Transcoding for MoneyAsText {
            fn tag(&self) -> &'static str {
                "money"
            }

            fn encode(&self, data: &Value) -> Result<Value, EncodingError> {
                Ok(data.clone())
            }

            fn decode(&self, data: Value) -> Result<Value, DecodingError> {
                Ok(data)
            }
        }

        let mut transcoder = JsonTranscoder::default();
        transcoder.register(MoneyAsText);

        let value = Value::custom("money", Value::Text("12.50 EUR".to_owned()));
        let encoded = transcoder.encode(&value).expect("encoding should not fail");
        let decoded = transcoder.decode(&encoded).expect("decoding should not fail");

        assert_eq!(value, decoded);
    }
}
