//! Device key store with rotation history.
//!
//! ```text
//!   rotate(k3)                     backend writes
//!   ─────────────────────────────  ───────────────────────────────
//!   current: k2   history: [k1]    1. history ← [k2, k1]  (durable)
//!        │                         2. current ← k3        (durable)
//!        ▼                         3. memory updated
//!   current: k3   history: [k2, k1]
//! ```
//!
//! History is written before the new current key, so a crash between the two
//! writes leaves the old key in both places. [`KeyStore::open`] repairs that
//! duplicate on the next start.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::KeyPair;
use crate::error::CourierResult;
use crate::storage::SecretStore;

/// Result of [`KeyStore::rotate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// New key installed. `archived` is true if the previous key was moved
    /// into history.
    Installed { archived: bool },
    /// The offered key is already current.
    Unchanged,
}

#[derive(Default)]
struct KeyState {
    current: Option<KeyPair>,
    /// Most recently superseded first
    history: Vec<KeyPair>,
}

/// Owns the device's current key pair and its rotation history.
///
/// Readers take a shared lock; `rotate` and `clear` hold the write lock for
/// the whole persist-then-install sequence.
pub struct KeyStore {
    backend: Arc<dyn SecretStore>,
    state: RwLock<KeyState>,
    history_limit: Option<usize>,
}

impl KeyStore {
    /// Load key state from `backend`.
    ///
    /// # Arguments
    ///
    /// * `backend` - Secure storage holding the current pair and history
    /// * `history_limit` - Maximum history length; `None` keeps everything
    pub fn open(backend: Arc<dyn SecretStore>, history_limit: Option<usize>) -> CourierResult<Self> {
        let current = backend.load_current()?;
        let loaded = backend.load_history()?;
        let loaded_len = loaded.len();

        let mut history: Vec<KeyPair> = Vec::with_capacity(loaded.len());
        for pair in loaded {
            if history.iter().any(|h| h.public_key() == pair.public_key()) {
                continue;
            }
            history.push(pair);
        }

        if let Some(ref current) = current {
            history.retain(|h| h.public_key() != current.public_key());
        }

        let repaired = loaded_len - history.len();
        if repaired > 0 {
            warn!(
                removed = repaired,
                "Duplicate keys found in history, repairing interrupted rotation"
            );
            backend.store_history(&history)?;
        }

        info!(
            has_current = current.is_some(),
            history_len = history.len(),
            "Key store opened"
        );

        Ok(Self {
            backend,
            state: RwLock::new(KeyState { current, history }),
            history_limit,
        })
    }

    /// Generate a new X25519 key pair from the OS CSPRNG.
    pub fn generate_key_pair() -> CourierResult<KeyPair> {
        KeyPair::generate()
    }

    /// Install `new_pair` as the current key, archiving the previous one.
    pub fn rotate(&self, new_pair: KeyPair) -> CourierResult<RotationOutcome> {
        let mut state = self.state.write();

        if let Some(ref current) = state.current {
            if current.same_as(&new_pair) {
                debug!(key = %new_pair.fingerprint(), "Rotation to current key ignored");
                return Ok(RotationOutcome::Unchanged);
            }
        }

        let mut history = state.history.clone();
        let mut archived = false;

        if let Some(ref previous) = state.current {
            if !history
                .iter()
                .any(|h| h.public_key() == previous.public_key())
            {
                history.insert(0, previous.clone());
                archived = true;
            }
        }

        history.retain(|h| h.public_key() != new_pair.public_key());

        if let Some(limit) = self.history_limit {
            if history.len() > limit {
                warn!(
                    dropped = history.len() - limit,
                    limit, "Key history over limit, dropping oldest keys"
                );
                history.truncate(limit);
            }
        }

        // History must be durable before the new key replaces the old one.
        self.backend.store_history(&history)?;
        self.backend.store_current(&new_pair)?;

        info!(
            key = %new_pair.fingerprint(),
            history_len = history.len(),
            archived,
            "Installed new device key"
        );

        state.history = history;
        state.current = Some(new_pair);

        Ok(RotationOutcome::Installed { archived })
    }

    pub fn current(&self) -> Option<KeyPair> {
        self.state.read().current.clone()
    }

    /// Superseded key pairs, most recently superseded first.
    pub fn history(&self) -> Vec<KeyPair> {
        self.state.read().history.clone()
    }

    /// `[current, history...]` under a single read lock.
    pub fn decryption_candidates(&self) -> Vec<KeyPair> {
        let state = self.state.read();
        state
            .current
            .iter()
            .chain(state.history.iter())
            .cloned()
            .collect()
    }

    pub fn has_key(&self) -> bool {
        self.state.read().current.is_some()
    }

    /// Irreversibly erase all key material, in storage and in memory.
    pub fn clear(&self) -> CourierResult<()> {
        let mut state = self.state.write();
        self.backend.wipe()?;
        // KeyPair zeroizes on drop
        state.current = None;
        state.history.clear();
        info!("Device keys cleared");
        Ok(())
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("KeyStore")
            .field("current", &state.current.as_ref().map(|k| k.fingerprint()))
            .field("history_len", &state.history.len())
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySecretStore;

    fn pair(seed: u8) -> KeyPair {
        KeyPair::from_secret([seed; 32], seed as i64)
    }

    fn store() -> (Arc<MemorySecretStore>, KeyStore) {
        let backend = Arc::new(MemorySecretStore::new());
        let ks = KeyStore::open(backend.clone(), None).unwrap();
        (backend, ks)
    }

    #[test]
    fn test_first_rotation_archives_nothing() {
        let (_, ks) = store();
        let outcome = ks.rotate(pair(1)).unwrap();
        assert_eq!(outcome, RotationOutcome::Installed { archived: false });
        assert!(ks.current().unwrap().same_as(&pair(1)));
        assert!(ks.history().is_empty());
    }

    #[test]
    fn test_rotation_archives_most_recent_first() {
        let (_, ks) = store();
        ks.rotate(pair(1)).unwrap();
        ks.rotate(pair(2)).unwrap();
        ks.rotate(pair(3)).unwrap();

        let history = ks.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].same_as(&pair(2)));
        assert!(history[1].same_as(&pair(1)));
    }

    #[test]
    fn test_rotate_to_same_key_is_unchanged() {
        let (_, ks) = store();
        ks.rotate(pair(1)).unwrap();
        assert_eq!(ks.rotate(pair(1)).unwrap(), RotationOutcome::Unchanged);
        assert!(ks.history().is_empty());
    }

    #[test]
    fn test_rotate_back_to_historic_key_removes_it_from_history() {
        let (_, ks) = store();
        ks.rotate(pair(1)).unwrap();
        ks.rotate(pair(2)).unwrap();
        ks.rotate(pair(1)).unwrap();

        let history = ks.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].same_as(&pair(2)));
        assert!(ks.current().unwrap().same_as(&pair(1)));
    }

    #[test]
    fn test_history_limit_drops_oldest() {
        let backend = Arc::new(MemorySecretStore::new());
        let ks = KeyStore::open(backend, Some(2)).unwrap();
        for seed in 1..=5 {
            ks.rotate(pair(seed)).unwrap();
        }
        let history = ks.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].same_as(&pair(4)));
        assert!(history[1].same_as(&pair(3)));
    }

    #[test]
    fn test_decryption_candidates_order() {
        let (_, ks) = store();
        ks.rotate(pair(1)).unwrap();
        ks.rotate(pair(2)).unwrap();
        let candidates = ks.decryption_candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].same_as(&pair(2)));
        assert!(candidates[1].same_as(&pair(1)));
    }

    #[test]
    fn test_rotation_is_persisted() {
        let (backend, ks) = store();
        ks.rotate(pair(1)).unwrap();
        ks.rotate(pair(2)).unwrap();
        drop(ks);

        let reopened = KeyStore::open(backend, None).unwrap();
        assert!(reopened.current().unwrap().same_as(&pair(2)));
        assert_eq!(reopened.history().len(), 1);
    }

    #[test]
    fn test_open_repairs_interrupted_rotation() {
        let backend = Arc::new(MemorySecretStore::new());
        // History written, install of the new key never happened
        backend.store_current(&pair(1)).unwrap();
        backend.store_history(&[pair(1), pair(1)]).unwrap();

        let ks = KeyStore::open(backend.clone(), None).unwrap();
        assert!(ks.current().unwrap().same_as(&pair(1)));
        assert!(ks.history().is_empty());
        assert!(backend.load_history().unwrap().is_empty());
    }

    #[test]
    fn test_clear_wipes_memory_and_backend() {
        let (backend, ks) = store();
        ks.rotate(pair(1)).unwrap();
        ks.rotate(pair(2)).unwrap();

        ks.clear().unwrap();

        assert!(ks.current().is_none());
        assert!(ks.history().is_empty());
        assert!(!ks.has_key());
        assert!(backend.load_current().unwrap().is_none());
        assert!(backend.load_history().unwrap().is_empty());
    }

    #[test]
    fn test_debug_shows_only_fingerprints() {
        let (_, ks) = store();
        ks.rotate(pair(7)).unwrap();
        let rendered = format!("{:?}", ks);
        assert!(rendered.contains(&pair(7).fingerprint()));
        assert!(!rendered.contains("secret"));
    }
}
