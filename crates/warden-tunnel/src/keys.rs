//! WireGuard key material.
//!
//! X25519 keys with base64 encoding, backed by the curve types the tunnel
//! engine consumes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use boringtun::x25519::{PublicKey as X25519Public, StaticSecret};
use rand::rngs::OsRng;
use std::fmt;

/// Tunnel private key (Curve25519).
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Create from a base64 string.
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode_key(s)?))
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// The underlying secret, cloned for handing to the tunnel engine.
    pub(crate) fn secret(&self) -> StaticSecret {
        self.secret.clone()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Tunnel public key (Curve25519).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode_key(s)?))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// The underlying key, cloned for handing to the tunnel engine.
    pub(crate) fn key(&self) -> X25519Public {
        self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Key parsing errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_32_bytes() {
        let key = PrivateKey::generate();
        assert_eq!(key.to_bytes().len(), 32);
        assert_eq!(key.public_key().to_bytes().len(), 32);
    }

    #[test]
    fn base64_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn public_key_is_deterministic() {
        let key = PrivateKey::generate();
        assert_eq!(key.public_key().to_bytes(), key.public_key().to_bytes());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(PublicKey::from_base64("not-valid-base64!!!").is_err());
        assert!(PublicKey::from_base64("c2hvcnQ=").is_err());
    }
}
