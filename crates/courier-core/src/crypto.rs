//! End-to-end message encryption using X25519 + XChaCha20-Poly1305
//!
//! ## Construction
//!
//! ```text
//! SEAL (sender A → recipient B):
//! 1. shared = X25519(A.secret, B.public)          reject non-contributory
//! 2. key    = HKDF-SHA256(shared, info = "courier-box-v1" || min(pkA,pkB) || max(pkA,pkB))
//! 3. nonce  = 24 random bytes
//! 4. ct     = XChaCha20-Poly1305(key, nonce, plaintext, aad = pkA)
//!
//! OPEN (on B's device):
//!   for sk in [current, history...]:
//!       shared = X25519(sk, pkA) → key → try decrypt
//!   first authenticating candidate wins, else DecryptionFailed
//! ```
//!
//! Sorting the two public keys in the HKDF info makes the derived key the same
//! on both ends. The sender key is bound as associated data, so an envelope
//! relabelled with another sender fails authentication.
//!
//! ## Wire Format
//!
//! ```json
//! { "ciphertext": "<base64>", "nonce": "<base64, 24 bytes>", "senderPublicKey": "<base64, 32 bytes>" }
//! ```

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroizing;

use crate::error::{CourierError, CourierResult};
use crate::keys::{KeyPair, KeyStore, KEY_SIZE};
use crate::logging::fingerprint;

/// Nonce size for XChaCha20-Poly1305 (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Domain separation prefix for HKDF
const HKDF_INFO: &[u8] = b"courier-box-v1";

/// The encrypted, authenticated unit sent in place of plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "base64_bytes")]
    pub sender_public_key: [u8; KEY_SIZE],
}

/// Stateless encrypt/decrypt over the device's key store.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use courier_core::{CipherEngine, KeyStore, MemorySecretStore};
///
/// let alice_keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
/// alice_keys.rotate(KeyStore::generate_key_pair().unwrap()).unwrap();
/// let bob_keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
/// bob_keys.rotate(KeyStore::generate_key_pair().unwrap()).unwrap();
///
/// let alice = CipherEngine::new(alice_keys.clone());
/// let bob = CipherEngine::new(bob_keys.clone());
///
/// let bob_public = *bob_keys.current().unwrap().public_key();
/// let alice_public = *alice_keys.current().unwrap().public_key();
///
/// let envelope = alice.encrypt(b"hello", &bob_public).unwrap();
/// assert_eq!(bob.decrypt(&envelope, &alice_public).unwrap(), b"hello");
/// ```
#[derive(Debug, Clone)]
pub struct CipherEngine {
    keys: Arc<KeyStore>,
}

impl CipherEngine {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { keys }
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Seal `plaintext` for the holder of `recipient_public_key`.
    ///
    /// # Arguments
    ///
    /// * `plaintext` - Message bytes
    /// * `recipient_public_key` - The recipient's current X25519 public key
    ///
    /// # Errors
    ///
    /// `NoLocalKey` if this device has no key pair yet.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8; KEY_SIZE],
    ) -> CourierResult<EncryptedEnvelope> {
        let own = self.keys.current().ok_or(CourierError::NoLocalKey)?;

        let key = derive_box_key(&own, recipient_public_key)
            .ok_or_else(|| CourierError::Crypto("Recipient public key is invalid".to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: own.public_key(),
                },
            )
            .map_err(|e| CourierError::Crypto(format!("Encryption failed: {}", e)))?;

        debug!(
            sender = %own.fingerprint(),
            recipient = %fingerprint(recipient_public_key),
            len = ciphertext.len(),
            "Sealed envelope"
        );

        Ok(EncryptedEnvelope {
            ciphertext,
            nonce,
            sender_public_key: *own.public_key(),
        })
    }

    /// Open an envelope from `expected_sender_public_key`.
    ///
    /// Tries the current key, then each superseded key, most recent first.
    /// Wrong key, tampered ciphertext and a mismatched sender all fail with
    /// the same `DecryptionFailed`.
    pub fn decrypt(
        &self,
        envelope: &EncryptedEnvelope,
        expected_sender_public_key: &[u8; KEY_SIZE],
    ) -> CourierResult<Vec<u8>> {
        if &envelope.sender_public_key != expected_sender_public_key {
            debug!("Envelope sender does not match expected key");
            return Err(CourierError::DecryptionFailed);
        }

        let candidates = self.keys.decryption_candidates();
        if candidates.is_empty() {
            return Err(CourierError::NoLocalKey);
        }

        for (attempt, candidate) in candidates.iter().enumerate() {
            if let Some(plaintext) = open_with(candidate, envelope) {
                debug!(
                    attempt,
                    key = %candidate.fingerprint(),
                    "Opened envelope"
                );
                return Ok(plaintext);
            }
        }

        debug!(
            attempts = candidates.len(),
            sender = %fingerprint(&envelope.sender_public_key),
            "No candidate key opened envelope"
        );
        Err(CourierError::DecryptionFailed)
    }

    /// Decrypt and decode as UTF-8.
    ///
    /// Invalid UTF-8 is reported as `DecryptionFailed`.
    pub fn open_text(
        &self,
        envelope: &EncryptedEnvelope,
        expected_sender_public_key: &[u8; KEY_SIZE],
    ) -> CourierResult<String> {
        let bytes = self.decrypt(envelope, expected_sender_public_key)?;
        String::from_utf8(bytes).map_err(|_| CourierError::DecryptionFailed)
    }
}

/// One decrypt attempt with a single candidate key.
fn open_with(candidate: &KeyPair, envelope: &EncryptedEnvelope) -> Option<Vec<u8>> {
    let key = derive_box_key(candidate, &envelope.sender_public_key)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    cipher
        .decrypt(
            XNonce::from_slice(&envelope.nonce),
            Payload {
                msg: &envelope.ciphertext,
                aad: &envelope.sender_public_key,
            },
        )
        .ok()
}

/// Derive the symmetric key shared by `own` and `peer_public`.
///
/// Returns `None` for a non-contributory (low-order) peer key.
fn derive_box_key(
    own: &KeyPair,
    peer_public: &[u8; KEY_SIZE],
) -> Option<Zeroizing<[u8; 32]>> {
    let shared = own
        .x25519_secret()
        .diffie_hellman(&X25519PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return None;
    }

    let (low, high) = if own.public_key() <= peer_public {
        (own.public_key(), peer_public)
    } else {
        (peer_public, own.public_key())
    };

    let mut info = Vec::with_capacity(HKDF_INFO.len() + 2 * KEY_SIZE);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(low);
    info.extend_from_slice(high);

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hkdf.expand(&info, &mut okm[..]).ok()?;
    Some(okm)
}

/// Serde helper: byte containers as standard base64 strings.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| D::Error::custom(format!("unexpected length {}", len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySecretStore;

    fn device() -> (Arc<KeyStore>, CipherEngine) {
        let keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
        keys.rotate(KeyPair::generate().unwrap()).unwrap();
        let engine = CipherEngine::new(keys.clone());
        (keys, engine)
    }

    fn public(keys: &KeyStore) -> [u8; KEY_SIZE] {
        *keys.current().unwrap().public_key()
    }

    #[test]
    fn test_roundtrip() {
        let (a_keys, alice) = device();
        let (b_keys, bob) = device();

        let envelope = alice.encrypt(b"hello", &public(&b_keys)).unwrap();
        let plaintext = bob.decrypt(&envelope, &public(&a_keys)).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let (_, alice) = device();
        let (b_keys, _) = device();
        let e1 = alice.encrypt(b"same", &public(&b_keys)).unwrap();
        let e2 = alice.encrypt(b"same", &public(&b_keys)).unwrap();
        assert_ne!(e1.nonce, e2.nonce);
        assert_ne!(e1.ciphertext, e2.ciphertext);
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
        let engine = CipherEngine::new(keys);
        let result = engine.encrypt(b"x", &[9u8; 32]);
        assert!(matches!(result, Err(CourierError::NoLocalKey)));
    }

    #[test]
    fn test_low_order_recipient_rejected() {
        let (_, alice) = device();
        let result = alice.encrypt(b"x", &[0u8; 32]);
        assert!(matches!(result, Err(CourierError::Crypto(_))));
    }

    #[test]
    fn test_decrypt_after_rotation_uses_history() {
        let (a_keys, alice) = device();
        let (b_keys, bob) = device();
        let sender = public(&a_keys);

        let old = alice.encrypt(b"before rotation", &public(&b_keys)).unwrap();
        b_keys.rotate(KeyPair::generate().unwrap()).unwrap();
        let new = alice.encrypt(b"after rotation", &public(&b_keys)).unwrap();

        assert_eq!(bob.decrypt(&old, &sender).unwrap(), b"before rotation");
        assert_eq!(bob.decrypt(&new, &sender).unwrap(), b"after rotation");
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let (a_keys, alice) = device();
        let (b_keys, _) = device();
        let (_, eve) = device();

        let envelope = alice.encrypt(b"secret", &public(&b_keys)).unwrap();
        let result = eve.decrypt(&envelope, &public(&a_keys));
        assert!(matches!(result, Err(CourierError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (a_keys, alice) = device();
        let (b_keys, bob) = device();

        let mut envelope = alice.encrypt(b"integrity", &public(&b_keys)).unwrap();
        envelope.ciphertext[0] ^= 0x01;
        let result = bob.decrypt(&envelope, &public(&a_keys));
        assert!(matches!(result, Err(CourierError::DecryptionFailed)));
    }

    #[test]
    fn test_sender_mismatch_fails_identically() {
        let (_, alice) = device();
        let (b_keys, bob) = device();
        let (m_keys, _) = device();

        let envelope = alice.encrypt(b"hi", &public(&b_keys)).unwrap();
        let result = bob.decrypt(&envelope, &public(&m_keys));
        assert!(matches!(result, Err(CourierError::DecryptionFailed)));
    }

    #[test]
    fn test_relabelled_sender_fails() {
        let (_, alice) = device();
        let (b_keys, bob) = device();
        let (m_keys, _) = device();

        let mut envelope = alice.encrypt(b"hi", &public(&b_keys)).unwrap();
        envelope.sender_public_key = public(&m_keys);
        let result = bob.decrypt(&envelope, &public(&m_keys));
        assert!(matches!(result, Err(CourierError::DecryptionFailed)));
    }

    #[test]
    fn test_open_text_rejects_invalid_utf8() {
        let (a_keys, alice) = device();
        let (b_keys, bob) = device();

        let envelope = alice.encrypt(&[0xff, 0xfe], &public(&b_keys)).unwrap();
        let result = bob.open_text(&envelope, &public(&a_keys));
        assert!(matches!(result, Err(CourierError::DecryptionFailed)));
    }

    #[test]
    fn test_envelope_json_uses_base64() {
        let (_, alice) = device();
        let (b_keys, _) = device();
        let envelope = alice.encrypt(b"wire", &public(&b_keys)).unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json["ciphertext"].is_string());
        assert!(json["senderPublicKey"].is_string());

        let parsed: EncryptedEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_envelope_json_rejects_short_nonce() {
        let json = serde_json::json!({
            "ciphertext": "AAAA",
            "nonce": "AAAA",
            "senderPublicKey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        });
        assert!(serde_json::from_value::<EncryptedEnvelope>(json).is_err());
    }
}
