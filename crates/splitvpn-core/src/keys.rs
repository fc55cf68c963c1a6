//! Tunnel Keys
//!
//! Curve25519 keys as they appear in a tunnel configuration blob: standard
//! base64 of 32 raw bytes. The tunnel engine does the actual cryptography;
//! this module validates the encoding and keeps the secret half out of logs.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;

/// Decode a base64 key, tolerating surrounding whitespace
///
/// Intermediate buffers are wiped so a private key leaves no copies behind.
fn decode_key(encoded: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let raw = Zeroizing::new(
        BASE64
            .decode(encoded.trim())
            .map_err(|_| KeyError::InvalidBase64)?,
    );

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if raw.len() != key.len() {
        return Err(KeyError::InvalidLength(raw.len()));
    }
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Interface (local) private key
///
/// Two keys are equal when they derive the same public key. The secret is
/// wiped on drop.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Fresh key from the OS random source
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_key(encoded).map(|bytes| Self(StaticSecret::from(*bytes)))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0))
    }

    /// Base64 form, wiped when the returned string is dropped
    pub fn to_base64(&self) -> Zeroizing<String> {
        let raw = Zeroizing::new(self.0.to_bytes());
        Zeroizing::new(BASE64.encode(raw.as_slice()))
    }
}

impl FromStr for PrivateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// Peer (server) public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_key(encoded).map(|bytes| Self(X25519Public::from(*bytes)))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

// Debug shows a short prefix, enough to tell peers apart in logs
impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        write!(f, "PublicKey({}...)", &encoded[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Private key together with its derived public key
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from(PrivateKey::generate())
    }
}

impl From<PrivateKey> for KeyPair {
    fn from(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPair").field(&self.public).finish()
    }
}

/// Key decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Key is not valid base64")]
    InvalidBase64,

    #[error("Key decodes to {0} bytes, expected 32")]
    InvalidLength(usize),
}
