//! Secure storage for device key material.
//!
//! The [`KeyStore`](crate::keys::KeyStore) persists through a [`SecretStore`]
//! which holds exactly two entries under fixed identifiers: the current key
//! pair and the history of superseded pairs. Two backends are provided:
//!
//! - [`MemorySecretStore`]: process-local, for tests and ephemeral sessions
//! - [`RedbSecretStore`]: ACID persistence in a redb database file

use std::path::Path;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use zeroize::Zeroizing;

use crate::error::{CourierError, CourierResult};
use crate::keys::KeyPair;

const DEVICE_KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("device_keys");

/// Fixed identifier of the current key pair
pub const CURRENT_KEY_ENTRY: &str = "current";
/// Fixed identifier of the key history
pub const KEY_HISTORY_ENTRY: &str = "history";

/// Backend that holds the device key pair and its rotation history.
///
/// Writes must be durable when they return `Ok`: the key store relies on
/// history being persisted before a new current key is installed.
pub trait SecretStore: Send + Sync {
    fn load_current(&self) -> CourierResult<Option<KeyPair>>;
    fn load_history(&self) -> CourierResult<Vec<KeyPair>>;
    fn store_current(&self, pair: &KeyPair) -> CourierResult<()>;
    fn store_history(&self, history: &[KeyPair]) -> CourierResult<()>;
    /// Irreversibly remove both entries.
    fn wipe(&self) -> CourierResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemorySecretStore {
    current: Mutex<Option<KeyPair>>,
    history: Mutex<Vec<KeyPair>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn load_current(&self) -> CourierResult<Option<KeyPair>> {
        Ok(self.current.lock().clone())
    }

    fn load_history(&self) -> CourierResult<Vec<KeyPair>> {
        Ok(self.history.lock().clone())
    }

    fn store_current(&self, pair: &KeyPair) -> CourierResult<()> {
        *self.current.lock() = Some(pair.clone());
        Ok(())
    }

    fn store_history(&self, history: &[KeyPair]) -> CourierResult<()> {
        *self.history.lock() = history.to_vec();
        Ok(())
    }

    fn wipe(&self) -> CourierResult<()> {
        self.current.lock().take();
        self.history.lock().clear();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// redb backend
// ═══════════════════════════════════════════════════════════════════════

/// Key storage in a redb database file.
///
/// Entries are postcard-encoded. Serialization buffers are zeroized after
/// use since they contain secret key bytes.
pub struct RedbSecretStore {
    db: Database,
}

impl RedbSecretStore {
    /// Open (or create) the key database at `path`.
    ///
    /// Creates the parent directory and the `device_keys` table if needed.
    pub fn open(path: impl AsRef<Path>) -> CourierResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DEVICE_KEYS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn read_entry(&self, entry: &str) -> CourierResult<Option<Zeroizing<Vec<u8>>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICE_KEYS_TABLE)?;
        Ok(table
            .get(entry)?
            .map(|v| Zeroizing::new(v.value().to_vec())))
    }

    fn write_entry(&self, entry: &str, data: &[u8]) -> CourierResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEVICE_KEYS_TABLE)?;
            table.insert(entry, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl SecretStore for RedbSecretStore {
    fn load_current(&self) -> CourierResult<Option<KeyPair>> {
        match self.read_entry(CURRENT_KEY_ENTRY)? {
            Some(bytes) => {
                let pair: KeyPair = postcard::from_bytes(&bytes)
                    .map_err(|e| CourierError::Serialization(e.to_string()))?;
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    fn load_history(&self) -> CourierResult<Vec<KeyPair>> {
        match self.read_entry(KEY_HISTORY_ENTRY)? {
            Some(bytes) => postcard::from_bytes(&bytes)
                .map_err(|e| CourierError::Serialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn store_current(&self, pair: &KeyPair) -> CourierResult<()> {
        let data = Zeroizing::new(
            postcard::to_allocvec(pair).map_err(|e| CourierError::Serialization(e.to_string()))?,
        );
        self.write_entry(CURRENT_KEY_ENTRY, &data)
    }

    fn store_history(&self, history: &[KeyPair]) -> CourierResult<()> {
        let data = Zeroizing::new(
            postcard::to_allocvec(history)
                .map_err(|e| CourierError::Serialization(e.to_string()))?,
        );
        self.write_entry(KEY_HISTORY_ENTRY, &data)
    }

    fn wipe(&self) -> CourierResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEVICE_KEYS_TABLE)?;
            table.remove(CURRENT_KEY_ENTRY)?;
            table.remove(KEY_HISTORY_ENTRY)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pair(seed: u8) -> KeyPair {
        KeyPair::from_secret([seed; 32], seed as i64)
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        assert!(store.load_current().unwrap().is_none());

        store.store_current(&pair(1)).unwrap();
        store.store_history(&[pair(2), pair(3)]).unwrap();

        assert!(store.load_current().unwrap().unwrap().same_as(&pair(1)));
        assert_eq!(store.load_history().unwrap().len(), 2);

        store.wipe().unwrap();
        assert!(store.load_current().unwrap().is_none());
        assert!(store.load_history().unwrap().is_empty());
    }

    #[test]
    fn test_redb_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.redb");

        {
            let store = RedbSecretStore::open(&path).unwrap();
            store.store_history(&[pair(2)]).unwrap();
            store.store_current(&pair(1)).unwrap();
        }

        let store = RedbSecretStore::open(&path).unwrap();
        let current = store.load_current().unwrap().unwrap();
        assert!(current.same_as(&pair(1)));
        assert_eq!(current.created_at(), 1);

        let history = store.load_history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].same_as(&pair(2)));
    }

    #[test]
    fn test_redb_wipe_removes_everything() {
        let dir = tempdir().unwrap();
        let store = RedbSecretStore::open(dir.path().join("keys.redb")).unwrap();
        store.store_current(&pair(1)).unwrap();
        store.store_history(&[pair(2)]).unwrap();

        store.wipe().unwrap();

        assert!(store.load_current().unwrap().is_none());
        assert!(store.load_history().unwrap().is_empty());
    }

    #[test]
    fn test_redb_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("keys.redb");
        RedbSecretStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
