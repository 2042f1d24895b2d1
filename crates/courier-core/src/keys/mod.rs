//! Device key management
//!
//! Each device owns one X25519 key pair. Rotating it keeps the superseded
//! pairs around so messages sealed to an older key still open.

mod keypair;
mod store;

pub use keypair::{decode_public_key, encode_public_key, KeyPair, KEY_SIZE};
pub use store::{KeyStore, RotationOutcome};
