//! Module `mapper` contains the translation layer between user-defined
//! [`DomainEvent`]s and the [`StoredEvent`]s recorded by the persistence
//! substrate.
//!
//! A [`Mapper`] composes a [`Transcoder`] with an optional
//! [`Compressor`] and an optional [`Cipher`]. The write pipeline is
//! fixed: serialize, then compress, then encrypt; reads reverse it.
//!
//! Reconstruction is driven by a [`TopicRegistry`] built during
//! composition: every topic the application can encounter maps to a
//! constructor function, so deployment mismatches surface as
//! [`MapperError::UnknownTopic`] instead of silently misparsed state.

use std::sync::Arc;

use crate::cipher::{Cipher, DecryptionError, EncryptionError};
use crate::compressor::{Compressor, DecompressionError};
use crate::env::{self, EnvError, Environment};
use crate::event::{DomainEvent, OriginatorId, StoredEvent};
use crate::transcoder::{DecodingError, EncodingError, Transcoder, Value};
use crate::version::Version;

/// The recorded parts of an event handed to a [`TopicRegistry`]
/// constructor: the dedicated columns plus the decoded state payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedState {
    /// The id of the originator's sequence the event belongs to.
    pub originator_id: OriginatorId,

    /// The position of the event in the originator's sequence.
    pub originator_version: Version,

    /// The decoded residual payload.
    pub state: Value,
}

/// A constructor rebuilding a concrete domain event from its recorded
/// parts. Failures surface as [`MapperError::Incompatible`].
pub type Rebuild<E> = fn(RecordedState) -> anyhow::Result<E>;

/// Maps topics to domain-event constructors.
///
/// Built once during composition; the mapper fails fast with
/// [`MapperError::UnknownTopic`] on anything not registered here.
#[derive(Debug, Clone)]
pub struct TopicRegistry<E> {
    rebuilds: std::collections::HashMap<&'static str, Rebuild<E>>,
}

impl<E> Default for TopicRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> TopicRegistry<E> {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self {
            rebuilds: std::collections::HashMap::new(),
        }
    }

    /// Registers the constructor for a topic, builder style. A second
    /// registration for the same topic replaces the first.
    #[must_use]
    pub fn register(mut self, topic: &'static str, rebuild: Rebuild<E>) -> Self {
        self.rebuilds.insert(topic, rebuild);
        self
    }

    /// Returns whether the given topic has a registered constructor.
    pub fn contains(&self, topic: &str) -> bool {
        self.rebuilds.contains_key(topic)
    }

    /// Returns the registered topics.
    pub fn topics(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rebuilds.keys().copied()
    }

    fn get(&self, topic: &str) -> Option<Rebuild<E>> {
        self.rebuilds.get(topic).copied()
    }
}

/// All possible error types returned by the [`Mapper`].
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    /// The recorded topic has no registered constructor: a deployment
    /// mismatch, fatal for the affected event.
    #[error("no constructor registered for topic '{topic}'")]
    UnknownTopic {
        /// The unresolvable topic.
        topic: String,
    },

    /// The registered constructor rejected the decoded state: the
    /// recorded shape no longer matches the deployed event type.
    #[error("failed to rebuild domain event from recorded state: {0}")]
    Incompatible(#[source] anyhow::Error),

    /// The state payload could not be encoded; see [`EncodingError`].
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The recorded state could not be decoded; see [`DecodingError`].
    #[error(transparent)]
    Decoding(#[from] DecodingError),

    /// The recorded state could not be decompressed.
    #[error(transparent)]
    Decompression(#[from] DecompressionError),

    /// The state payload could not be encrypted.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// The recorded state could not be decrypted or failed
    /// authentication; see [`DecryptionError`].
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

/// Converts between [`DomainEvent`]s and [`StoredEvent`]s.
///
/// Thread-safe once configured; share it via [`Arc`] or through an
/// [`EventStore`][crate::store::EventStore].
pub struct Mapper<E> {
    transcoder: Arc<dyn Transcoder>,
    registry: TopicRegistry<E>,
    compressor: Option<Arc<dyn Compressor>>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl<E> Mapper<E>
where
    E: DomainEvent,
{
    /// Returns a mapper over the given transcoder and topic registry,
    /// with no compression and no encryption.
    pub fn new(transcoder: impl Transcoder + 'static, registry: TopicRegistry<E>) -> Self {
        Self {
            transcoder: Arc::new(transcoder),
            registry,
            compressor: None,
            cipher: None,
        }
    }

    /// Enables the compression stage.
    #[must_use]
    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Some(Arc::new(compressor));
        self
    }

    /// Enables the encryption stage.
    #[must_use]
    pub fn with_cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Configures the compression and encryption stages from the
    /// `COMPRESSOR_TOPIC`, `CIPHER_TOPIC` and `CIPHER_KEY` environment
    /// keys.
    pub fn with_pipeline_from_env(mut self, environment: &Environment) -> Result<Self, EnvError> {
        self.compressor = env::compressor_from_env(environment)?;
        self.cipher = env::cipher_from_env(environment)?;
        Ok(self)
    }

    /// Returns the registered topics of this mapper's registry.
    pub fn topics(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registry.topics()
    }

    /// Converts a domain event into its stored form: extracts the
    /// dedicated columns, then serializes (and possibly compresses and
    /// encrypts) the residual payload.
    pub fn to_stored(&self, event: &E) -> Result<StoredEvent, MapperError> {
        let mut state = self.transcoder.encode(&event.state())?;

        if let Some(compressor) = &self.compressor {
            state = compressor.compress(&state);
        }

        if let Some(cipher) = &self.cipher {
            state = cipher.encrypt(&state)?;
        }

        Ok(StoredEvent {
            originator_id: event.originator_id(),
            originator_version: event.originator_version(),
            topic: event.topic().to_owned(),
            state,
        })
    }

    /// Rebuilds a domain event from its stored form: reverses the state
    /// pipeline, then dispatches to the constructor registered for the
    /// recorded topic.
    pub fn to_domain(&self, stored: &StoredEvent) -> Result<E, MapperError> {
        let rebuild = self
            .registry
            .get(&stored.topic)
            .ok_or_else(|| MapperError::UnknownTopic {
                topic: stored.topic.clone(),
            })?;

        let mut state = stored.state.clone();

        if let Some(cipher) = &self.cipher {
            state = cipher.decrypt(&state)?;
        }

        if let Some(compressor) = &self.compressor {
            state = compressor.decompress(&state)?;
        }

        let decoded = self.transcoder.decode(&state)?;

        rebuild(RecordedState {
            originator_id: stored.originator_id,
            originator_version: stored.originator_version,
            state: decoded,
        })
        .map_err(MapperError::Incompatible)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use anyhow::Context;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::cipher::AesGcmCipher;
    use crate::compressor::ZlibCompressor;
    use crate::transcoder::JsonTranscoder;

    /// Domain event type shared by the mapper, store, in-memory and
    /// projection tests.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum CartEvent {
        ItemAdded {
            cart_id: Uuid,
            version: u64,
            at: DateTime<Utc>,
            sku: String,
            quantity: i64,
        },
    }

    pub(crate) const ITEM_ADDED: &str = "cart:ItemAdded";

    impl CartEvent {
        pub(crate) fn item_added(cart_id: Uuid, version: u64, sku: &str) -> Self {
            CartEvent::ItemAdded {
                cart_id,
                version,
                at: Utc::now(),
                sku: sku.to_owned(),
                quantity: 1,
            }
        }
    }

    impl DomainEvent for CartEvent {
        fn originator_id(&self) -> OriginatorId {
            match self {
                CartEvent::ItemAdded { cart_id, .. } => *cart_id,
            }
        }

        fn originator_version(&self) -> Version {
            match self {
                CartEvent::ItemAdded { version, .. } => *version,
            }
        }

        fn timestamp(&self) -> DateTime<Utc> {
            match self {
                CartEvent::ItemAdded { at, .. } => *at,
            }
        }

        fn topic(&self) -> &'static str {
            match self {
                CartEvent::ItemAdded { .. } => ITEM_ADDED,
            }
        }

        fn state(&self) -> Value {
            match self {
                CartEvent::ItemAdded {
                    at, sku, quantity, ..
                } => {
                    let mut state = BTreeMap::new();
                    state.insert("at".to_owned(), Value::datetime(*at));
                    state.insert("sku".to_owned(), Value::from(sku.as_str()));
                    state.insert("quantity".to_owned(), Value::from(*quantity));
                    Value::Mapping(state)
                }
            }
        }
    }

    fn rebuild_item_added(recorded: RecordedState) -> anyhow::Result<CartEvent> {
        let state = recorded
            .state
            .as_mapping()
            .context("state should be a mapping")?;

        Ok(CartEvent::ItemAdded {
            cart_id: recorded.originator_id,
            version: recorded.originator_version,
            at: state
                .get("at")
                .and_then(Value::to_datetime)
                .context("'at' should be a timestamp")?,
            sku: state
                .get("sku")
                .and_then(Value::as_text)
                .context("'sku' should be text")?
                .to_owned(),
            quantity: state
                .get("quantity")
                .and_then(Value::as_integer)
                .context("'quantity' should be an integer")?,
        })
    }

    pub(crate) fn cart_registry() -> TopicRegistry<CartEvent> {
        TopicRegistry::new().register(ITEM_ADDED, rebuild_item_added)
    }

    pub(crate) fn cart_mapper() -> Mapper<CartEvent> {
        Mapper::new(JsonTranscoder::default(), cart_registry())
    }

    #[test]
    fn events_round_trip_through_the_mapper() {
        let mapper = cart_mapper();
        let event = CartEvent::item_added(Uuid::new_v4(), 1, "SKU-1");

        let stored = mapper.to_stored(&event).expect("mapping should not fail");
        let rebuilt = mapper.to_domain(&stored).expect("demapping should not fail");

        // Timestamps survive at microsecond precision through the wire
        // format, which is what the default transcoding records.
        match (&event, &rebuilt) {
            (
                CartEvent::ItemAdded { at: original, .. },
                CartEvent::ItemAdded { at: roundtrip, .. },
            ) => {
                assert_eq!(original.timestamp_micros(), roundtrip.timestamp_micros());
            }
        }

        assert_eq!(event.originator_id(), rebuilt.originator_id());
        assert_eq!(event.originator_version(), rebuilt.originator_version());
        assert_eq!(event.topic(), rebuilt.topic());
    }

    #[test]
    fn unknown_topics_fail_fast() {
        let mapper = cart_mapper();
        let stored = StoredEvent {
            originator_id: Uuid::new_v4(),
            originator_version: 1,
            topic: "cart:Renamed".to_owned(),
            state: b"{}".to_vec(),
        };

        let err = mapper
            .to_domain(&stored)
            .expect_err("unregistered topics must not demap");

        assert!(matches!(err, MapperError::UnknownTopic { topic } if topic == "cart:Renamed"));
    }

    #[test]
    fn incompatible_state_is_reported() {
        let mapper = cart_mapper();
        let stored = StoredEvent {
            originator_id: Uuid::new_v4(),
            originator_version: 1,
            topic: ITEM_ADDED.to_owned(),
            state: b"{}".to_vec(),
        };

        let err = mapper
            .to_domain(&stored)
            .expect_err("an empty mapping is missing every field");

        assert!(matches!(err, MapperError::Incompatible(_)));
    }

    #[test]
    fn the_full_pipeline_round_trips_and_detects_tampering() {
        let key = AesGcmCipher::generate_key();
        let mapper = || {
            cart_mapper()
                .with_compressor(ZlibCompressor::default())
                .with_cipher(AesGcmCipher::from_base64(&key).expect("the key is valid"))
        };

        let event = CartEvent::ItemAdded {
            cart_id: Uuid::new_v4(),
            version: 1,
            at: Utc::now(),
            sku: "SKU-1 ".repeat(1700),
            quantity: 3,
        };

        let plain = cart_mapper().to_stored(&event).expect("mapping should not fail");
        let compressed = cart_mapper()
            .with_compressor(ZlibCompressor::default())
            .to_stored(&event)
            .expect("mapping should not fail");
        let sealed = mapper().to_stored(&event).expect("mapping should not fail");

        // Compression shrinks a 10 KB repetitive body; encryption adds
        // its nonce and tag back on top of the compressed size.
        assert!(compressed.state.len() < plain.state.len());
        assert!(sealed.state.len() > compressed.state.len());

        let rebuilt = mapper().to_domain(&sealed).expect("demapping should not fail");
        assert_eq!(event.originator_id(), rebuilt.originator_id());

        let mut tampered = sealed;
        let middle = tampered.state.len() / 2;
        tampered.state[middle] ^= 0b0100_0000;

        let err = mapper()
            .to_domain(&tampered)
            .expect_err("tampered state must not demap");

        assert!(matches!(
            err,
            MapperError::Decryption(DecryptionError::Authentication)
        ));
    }

    #[test]
    fn pipeline_configuration_comes_from_the_environment() {
        let env = Environment::new()
            .with(env::COMPRESSOR_TOPIC, "zlib")
            .with(env::CIPHER_TOPIC, "aes-gcm")
            .with(env::CIPHER_KEY, AesGcmCipher::generate_key());

        let mapper = cart_mapper()
            .with_pipeline_from_env(&env)
            .expect("the pipeline configuration is valid");

        let event = CartEvent::item_added(Uuid::new_v4(), 1, "SKU-1");
        let stored = mapper.to_stored(&event).expect("mapping should not fail");
        let rebuilt = mapper.to_domain(&stored).expect("demapping should not fail");

        assert_eq!(event.originator_id(), rebuilt.originator_id());
    }
}
