//! Message sealing with a shared key.
//!
//! Chat lines are sealed with ChaCha20-Poly1305 under a 32-byte key that all
//! participating peers share out of band. A sealed token is URL-safe base64
//! (no padding) of:
//!
//! ```text
//! version (1 byte) || nonce (12 bytes) || ciphertext + tag
//! ```
//!
//! so it never contains a line break and can be embedded in a stream frame.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Length of a shared key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of the per-token random nonce.
pub const NONCE_LENGTH: usize = 12;

/// Length of the Poly1305 authentication tag.
pub const TAG_LENGTH: usize = 16;

/// Version byte leading every token.
pub const TOKEN_VERSION: u8 = 1;

/// Domain separation prefix for passphrase-derived keys.
const PASSPHRASE_CONTEXT: &[u8] = b"lanchat-key-v1";

/// The confidentiality transform used on chat lines.
///
/// `open` must fail with [`ProtocolError::Decryption`] for any token that was
/// not produced by `seal` on a transform holding the same key.
pub trait Confidentiality: Send + Sync {
    /// Seal `plaintext` into a text-safe token.
    fn seal(&self, plaintext: &[u8]) -> Result<String>;

    /// Recover the plaintext from a token.
    fn open(&self, token: &str) -> Result<Vec<u8>>;
}

/// A 32-byte symmetric key shared by chatting peers.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatKey([u8; KEY_LENGTH]);

impl ChatKey {
    /// Generates a new random key from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Derives a key from a passphrase every peer knows.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(PASSPHRASE_CONTEXT);
        hasher.update(passphrase.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Encodes the key as URL-safe base64, the form operators exchange.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parses a key from URL-safe base64 (padding optional).
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim().trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl FromStr for ChatKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChatKey([REDACTED])")
    }
}

/// ChaCha20-Poly1305 implementation of [`Confidentiality`].
pub struct MessageCipher {
    cipher: ChaCha20Poly1305,
}

impl MessageCipher {
    /// Creates a cipher for the given shared key.
    pub fn new(key: &ChatKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }
}

impl fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCipher").finish_non_exhaustive()
    }
}

impl Confidentiality for MessageCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::Encryption("AEAD seal failed".to_string()))?;

        let mut raw = Vec::with_capacity(1 + NONCE_LENGTH + ciphertext.len());
        raw.push(TOKEN_VERSION);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn open(&self, token: &str) -> Result<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD.decode(token.trim())?;

        if raw.len() < 1 + NONCE_LENGTH + TAG_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "token too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(ProtocolError::Decryption(format!(
                "unsupported token version {}",
                raw[0]
            )));
        }

        let (nonce, ciphertext) = raw[1..].split_at(NONCE_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                ProtocolError::Decryption(
                    "authentication failed (corrupt token or different key)".to_string(),
                )
            })
    }
}
