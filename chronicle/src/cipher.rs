//! Contains the optional authenticated encryption stage of the state
//! pipeline. When enabled together with a
//! [`Compressor`][crate::compressor::Compressor], encryption always runs
//! last on write and first on read.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

/// Authenticated symmetric encryption applied to recorded state.
///
/// Implementations must detect tampering on decrypt and fail with
/// [`DecryptionError::Authentication`] rather than returning garbage.
pub trait Cipher: Send + Sync + fmt::Debug {
    /// Encrypts the given plaintext.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    /// Decrypts and authenticates the given ciphertext.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError>;
}

/// Error returned when a [`Cipher`] cannot be constructed from the
/// supplied key material.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// The configured key was not valid base64.
    #[error("cipher key is not valid base64: {0}")]
    InvalidKey(#[source] base64::DecodeError),

    /// The decoded key had the wrong length for the scheme.
    #[error("cipher key must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length in bytes.
        expected: usize,
        /// Length of the supplied key in bytes.
        actual: usize,
    },
}

/// Error returned when encryption itself fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to encrypt state")]
pub struct EncryptionError;

/// All possible error types returned when decrypting recorded state.
///
/// Both variants are data-integrity problems and fatal for the affected
/// event; they are never silently ignored by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    /// The authentication tag did not verify: the ciphertext was
    /// tampered with, or was produced with a different key.
    #[error("ciphertext failed authentication")]
    Authentication,

    /// The ciphertext is shorter than the nonce and tag overhead of the
    /// configured scheme, so no key could possibly decrypt it.
    #[error("ciphertext is shorter than the nonce and tag overhead")]
    KeyMismatch,
}

/// Default [`Cipher`] implementation: AES-256 in GCM mode.
///
/// The wire layout is `nonce || ciphertext || tag`, with a fresh random
/// 12-byte nonce drawn from the operating system for every encryption.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    /// Required key length in bytes.
    pub const KEY_LEN: usize = 32;

    /// Length of the random nonce prefix in bytes.
    pub const NONCE_LEN: usize = 12;

    const TAG_LEN: usize = 16;

    /// Returns a cipher using the given raw 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != Self::KEY_LEN {
            return Err(CipherError::InvalidKeyLength {
                expected: Self::KEY_LEN,
                actual: key.len(),
            });
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Returns a cipher from a base64-encoded key, the format used by
    /// the `CIPHER_KEY` environment variable.
    pub fn from_base64(key: &str) -> Result<Self, CipherError> {
        let decoded = BASE64.decode(key).map_err(CipherError::InvalidKey)?;
        Self::new(&decoded)
    }

    /// Generates a fresh random key, base64-encoded for configuration.
    pub fn generate_key() -> String {
        let mut key = [0u8; Self::KEY_LEN];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut nonce = [0u8; Self::NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EncryptionError)?;

        let mut out = Vec::with_capacity(Self::NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if ciphertext.len() < Self::NONCE_LEN + Self::TAG_LEN {
            return Err(DecryptionError::KeyMismatch);
        }

        let (nonce, sealed) = ciphertext.split_at(Self::NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DecryptionError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::from_base64(&AesGcmCipher::generate_key())
            .expect("generated keys should be valid")
    }

    #[test]
    fn encryption_round_trips() {
        let cipher = cipher();
        let plaintext = b"a domain event body".to_vec();

        let sealed = cipher.encrypt(&plaintext).expect("encryption should not fail");
        let opened = cipher.decrypt(&sealed).expect("decryption should not fail");

        assert_eq!(plaintext, opened);
        assert_ne!(plaintext, sealed);
    }

    #[test]
    fn every_encryption_uses_a_fresh_nonce() {
        let cipher = cipher();

        let first = cipher.encrypt(b"same body").expect("encryption should not fail");
        let second = cipher.encrypt(b"same body").expect("encryption should not fail");

        assert_ne!(first, second);
    }

    #[test]
    fn single_bit_tampering_is_detected() {
        let cipher = cipher();

        let mut sealed = cipher
            .encrypt(b"a domain event body")
            .expect("encryption should not fail");
        let last = sealed.len() - 1;
        sealed[last] ^= 0b0000_0001;

        let err = cipher
            .decrypt(&sealed)
            .expect_err("tampered ciphertext must not decrypt");

        assert!(matches!(err, DecryptionError::Authentication));
    }

    #[test]
    fn a_different_key_fails_authentication() {
        let sealed = cipher()
            .encrypt(b"a domain event body")
            .expect("encryption should not fail");

        let err = cipher()
            .decrypt(&sealed)
            .expect_err("a different key must not decrypt");

        assert!(matches!(err, DecryptionError::Authentication));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let err = cipher()
            .decrypt(b"short")
            .expect_err("truncated ciphertext must not decrypt");

        assert!(matches!(err, DecryptionError::KeyMismatch));
    }

    #[test]
    fn key_length_is_validated_at_construction() {
        let err = AesGcmCipher::new(&[0u8; 16]).expect_err("16-byte keys are rejected");

        assert!(matches!(
            err,
            CipherError::InvalidKeyLength {
                expected: 32,
                actual: 16,
            }
        ));
    }

    #[test]
    fn key_material_must_be_base64() {
        let err = AesGcmCipher::from_base64("%%% not base64 %%%")
            .expect_err("invalid base64 keys are rejected");

        assert!(matches!(err, CipherError::InvalidKey(_)));
    }
}
