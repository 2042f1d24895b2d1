//! X25519 device key pair
//!
//! The secret half never leaves the device: it is not printed by `Debug`,
//! it is zeroized on drop, and only a [`SecretStore`](crate::storage::SecretStore)
//! serializes it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CourierError, CourierResult};
use crate::logging::fingerprint;
use crate::types::now_millis;

/// Length of X25519 public and secret keys
pub const KEY_SIZE: usize = 32;

/// A device's asymmetric key pair.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    public_key: [u8; KEY_SIZE],
    secret_key: [u8; KEY_SIZE],
    /// Unix timestamp (ms) when the pair was generated
    created_at: i64,
}

impl KeyPair {
    /// Generate a new key pair from the operating system CSPRNG.
    ///
    /// Fails only if the RNG cannot be read.
    pub fn generate() -> CourierResult<Self> {
        let mut seed = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut seed)
            .map_err(|e| CourierError::RngUnavailable(e.to_string()))?;
        let pair = Self::from_secret(seed, now_millis());
        seed.zeroize();
        Ok(pair)
    }

    /// Rebuild a key pair from its secret half.
    pub fn from_secret(secret_key: [u8; KEY_SIZE], created_at: i64) -> Self {
        let secret = X25519StaticSecret::from(secret_key);
        let public_key = *X25519PublicKey::from(&secret).as_bytes();
        Self {
            public_key,
            secret_key: secret.to_bytes(),
            created_at,
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        &self.public_key
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Log-safe fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }

    /// Whether both halves match `other`.
    pub fn same_as(&self, other: &KeyPair) -> bool {
        self.public_key == other.public_key && self.secret_key == other.secret_key
    }

    /// X25519 secret for key agreement.
    pub(crate) fn x25519_secret(&self) -> X25519StaticSecret {
        X25519StaticSecret::from(self.secret_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.fingerprint())
            .field("secret_key", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Encode a public key as standard base64.
pub fn encode_public_key(key: &[u8; KEY_SIZE]) -> String {
    STANDARD.encode(key)
}

/// Decode a base64 public key, checking its length.
pub fn decode_public_key(encoded: &str) -> CourierResult<[u8; KEY_SIZE]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CourierError::Serialization(format!("Invalid base64 public key: {}", e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        CourierError::Serialization(format!(
            "Public key must be {} bytes (got {})",
            KEY_SIZE,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_pairs() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_from_secret_is_deterministic() {
        let a = KeyPair::from_secret([9u8; 32], 1);
        let b = KeyPair::from_secret([9u8; 32], 2);
        assert_eq!(a.public_key(), b.public_key());
        assert!(a.same_as(&b));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let pair = KeyPair::from_secret([0x5au8; 32], 0);
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("90, 90"));
        assert!(!rendered.contains("5a5a5a5a"));
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let encoded = encode_public_key(pair.public_key());
        assert_eq!(&decode_public_key(&encoded).unwrap(), pair.public_key());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let encoded = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            decode_public_key(&encoded),
            Err(CourierError::Serialization(_))
        ));
    }
}
