//! End-to-end payload encryption.
//!
//! Peers share a room secret out of band; the relay never sees it. The key
//! is derived deterministically so every peer holding the same secret gets
//! the same key without a handshake:
//!
//! ```text
//! secret ──PBKDF2-HMAC-SHA256(fixed salt, 100k rounds)──► 128-bit key
//! plaintext ──AES-128-GCM(key, fresh random 96-bit nonce)──► ciphertext ‖ tag
//! ```
//!
//! A nonce is drawn from the OS RNG for every seal and is never reused.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

use crate::protocol::{EncryptedPayload, IV_LEN};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const KEY_SALT: &[u8] = b"vellum/room-key/v1";
pub const KEY_LEN: usize = 16;
pub const ROOM_KEY_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Tag verification failed: tampered payload or wrong secret.
    #[error("payload failed authentication")]
    Authentication,
    #[error("invalid nonce length: {0} bytes")]
    InvalidNonce(usize),
    #[error("encryption failed")]
    Encryption,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A derived 128-bit room key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

pub fn derive_key(secret: &str) -> EncryptionKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KEY_SALT, PBKDF2_ITERATIONS, &mut key);
    EncryptionKey(key)
}

/// One-shot encryption. Derives the key on every call; prefer
/// [`PayloadCipher`] for repeated traffic.
pub fn encrypt(secret: &str, plaintext: &[u8]) -> Result<EncryptedPayload, CodecError> {
    PayloadCipher::new(secret).seal(plaintext)
}

pub fn decrypt(secret: &str, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
    PayloadCipher::new(secret).open_parts(iv, ciphertext)
}

/// Random URL-safe room secret for sharing in a link fragment.
pub fn generate_room_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_KEY_LEN)
        .map(char::from)
        .collect()
}

/// AES-128-GCM cipher bound to one derived key. Cheap to clone.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Arc<Aes128Gcm>,
}

impl PayloadCipher {
    pub fn new(secret: &str) -> Self {
        Self::from_key(&derive_key(secret))
    }

    pub fn from_key(key: &EncryptionKey) -> Self {
        let key = Key::<Aes128Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Arc::new(Aes128Gcm::new(key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CodecError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CodecError::Encryption)?;
        Ok(EncryptedPayload { ciphertext, iv })
    }

    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CodecError> {
        self.open_parts(&payload.iv, &payload.ciphertext)
    }

    pub fn open_parts(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if iv.len() != IV_LEN {
            return Err(CodecError::InvalidNonce(iv.len()));
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CodecError::Authentication)
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadCipher(..)")
    }
}
