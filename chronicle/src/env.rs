//! Contains the environment-style configuration surface of the library.
//!
//! Configuration travels as a plain string map ([`Environment`]),
//! usually captured from process environment variables. The core reads
//! the state-pipeline keys ([`COMPRESSOR_TOPIC`], [`CIPHER_TOPIC`],
//! [`CIPHER_KEY`]); backend crates read their own `POSTGRES_*` /
//! `SQLITE_*` keys from the same map; application composition reads
//! [`PERSISTENCE_MODULE`] to pick a backing store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cipher::{AesGcmCipher, Cipher, CipherError};
use crate::compressor::{Compressor, ZlibCompressor};

/// Selects the backing-store implementation: [`MEMORY_MODULE`],
/// [`SQLITE_MODULE`] or [`POSTGRES_MODULE`].
pub const PERSISTENCE_MODULE: &str = "PERSISTENCE_MODULE";

/// Truthy when datastores should attempt schema DDL on open.
pub const CREATE_TABLE: &str = "CREATE_TABLE";

/// Enables the compression stage of the state pipeline; the only
/// built-in value is [`ZLIB_COMPRESSOR`].
pub const COMPRESSOR_TOPIC: &str = "COMPRESSOR_TOPIC";

/// Enables the encryption stage of the state pipeline; the only
/// built-in value is [`AES_GCM_CIPHER`].
pub const CIPHER_TOPIC: &str = "CIPHER_TOPIC";

/// Base64-encoded key material for the configured cipher.
pub const CIPHER_KEY: &str = "CIPHER_KEY";

/// In-memory backing store.
pub const MEMORY_MODULE: &str = "memory";

/// File-backed single-writer backing store.
pub const SQLITE_MODULE: &str = "sqlite";

/// Server-based backing store.
pub const POSTGRES_MODULE: &str = "postgres";

/// [`COMPRESSOR_TOPIC`] value selecting [`ZlibCompressor`].
pub const ZLIB_COMPRESSOR: &str = "zlib";

/// [`CIPHER_TOPIC`] value selecting [`AesGcmCipher`].
pub const AES_GCM_CIPHER: &str = "aes-gcm";

/// All possible error types returned when reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// A required key was absent.
    #[error("environment variable {key} is required")]
    Missing {
        /// The absent key.
        key: String,
    },

    /// A key held a value the library cannot interpret.
    #[error("environment variable {key} has invalid value '{value}': {reason}")]
    Invalid {
        /// The offending key.
        key: String,
        /// The uninterpretable value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configured cipher key was rejected; see [`CipherError`].
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// A configuration map, usually captured from process environment
/// variables.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Returns an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current process environment.
    pub fn from_os() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Sets a key, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Returns the value of a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Interprets a key as a boolean, using the given default when the
    /// key is absent or empty.
    ///
    /// Truthy values are `y`, `yes`, `t`, `true`, `on` and `1`; falsy
    /// values are `n`, `no`, `f`, `false`, `off` and `0`;
    /// case-insensitive. Anything else fails with [`EnvError::Invalid`].
    pub fn truthy(&self, key: &str, default: bool) -> Result<bool, EnvError> {
        match self.get(key) {
            None | Some("") => Ok(default),
            Some(value) => strtobool(value).ok_or_else(|| EnvError::Invalid {
                key: key.to_owned(),
                value: value.to_owned(),
                reason: "expected a boolean (y/yes/t/true/on/1 or n/no/f/false/off/0)".to_owned(),
            }),
        }
    }
}

/// Parses a boolean configuration value, returning `None` when the
/// value is neither truthy nor falsy.
pub fn strtobool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Builds the optional compression stage from [`COMPRESSOR_TOPIC`].
pub fn compressor_from_env(env: &Environment) -> Result<Option<Arc<dyn Compressor>>, EnvError> {
    match env.get(COMPRESSOR_TOPIC) {
        None | Some("") => Ok(None),
        Some(value) if value.eq_ignore_ascii_case(ZLIB_COMPRESSOR) => {
            Ok(Some(Arc::new(ZlibCompressor::default())))
        }
        Some(value) => Err(EnvError::Invalid {
            key: COMPRESSOR_TOPIC.to_owned(),
            value: value.to_owned(),
            reason: format!("the only built-in compressor is '{ZLIB_COMPRESSOR}'"),
        }),
    }
}

/// Builds the optional encryption stage from [`CIPHER_TOPIC`] and
/// [`CIPHER_KEY`].
pub fn cipher_from_env(env: &Environment) -> Result<Option<Arc<dyn Cipher>>, EnvError> {
    match env.get(CIPHER_TOPIC) {
        None | Some("") => Ok(None),
        Some(value) if value.eq_ignore_ascii_case(AES_GCM_CIPHER) => {
            let key = env.get(CIPHER_KEY).ok_or_else(|| EnvError::Missing {
                key: CIPHER_KEY.to_owned(),
            })?;
            Ok(Some(Arc::new(AesGcmCipher::from_base64(key)?)))
        }
        Some(value) => Err(EnvError::Invalid {
            key: CIPHER_TOPIC.to_owned(),
            value: value.to_owned(),
            reason: format!("the only built-in cipher is '{AES_GCM_CIPHER}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_values_parse_case_insensitively() {
        for truthy in ["y", "YES", "t", "True", "ON", "1"] {
            assert_eq!(Some(true), strtobool(truthy), "'{truthy}' should be true");
        }

        for falsy in ["n", "NO", "f", "False", "OFF", "0"] {
            assert_eq!(Some(false), strtobool(falsy), "'{falsy}' should be false");
        }

        assert_eq!(None, strtobool("maybe"));
    }

    #[test]
    fn truthy_falls_back_to_the_default() {
        let env = Environment::new();

        assert!(env.truthy(CREATE_TABLE, true).expect("absent keys use the default"));
        assert!(!env.truthy(CREATE_TABLE, false).expect("absent keys use the default"));

        let env = env.with(CREATE_TABLE, "not-a-bool");
        assert!(env.truthy(CREATE_TABLE, true).is_err());
    }

    #[test]
    fn pipeline_stages_are_absent_by_default() {
        let env = Environment::new();

        assert!(compressor_from_env(&env)
            .expect("no compressor configured")
            .is_none());
        assert!(cipher_from_env(&env).expect("no cipher configured").is_none());
    }

    #[test]
    fn the_cipher_requires_key_material() {
        let env = Environment::new().with(CIPHER_TOPIC, AES_GCM_CIPHER);

        let err = cipher_from_env(&env).expect_err("the key is required");

        assert!(matches!(err, EnvError::Missing { key } if key == CIPHER_KEY));
    }

    #[test]
    fn unknown_pipeline_topics_are_rejected() {
        let env = Environment::new().with(COMPRESSOR_TOPIC, "lz77");

        let err = compressor_from_env(&env).expect_err("unknown compressors are rejected");

        assert!(matches!(err, EnvError::Invalid { .. }));
    }

    #[test]
    fn configured_stages_are_built() {
        use crate::cipher::AesGcmCipher;

        let env = Environment::new()
            .with(COMPRESSOR_TOPIC, "zlib")
            .with(CIPHER_TOPIC, "AES-GCM")
            .with(CIPHER_KEY, AesGcmCipher::generate_key());

        assert!(compressor_from_env(&env)
            .expect("zlib is built in")
            .is_some());
        assert!(cipher_from_env(&env).expect("aes-gcm is built in").is_some());
    }
}
