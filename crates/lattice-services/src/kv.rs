//! Bucketed key/value façade over the embedded storage engine.
//!
//! A bucket maps to one storage tree; values are opaque bytes. Nothing
//! above this module touches the engine directly — callers see only
//! put/get/delete/list_keys/get_all/delete_bucket. Operations are atomic
//! per key but not transactional across keys.

use std::path::Path;

/// Session records.
pub const SESSIONS_BUCKET: &str = "__sessions";
/// Validated config store records.
pub const STORES_BUCKET: &str = "__stores";
/// Reserved for api-key material.
pub const API_KEYS_BUCKET: &str = "__apikeys";

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage engine: {0}")]
    Engine(#[from] sled::Error),
}

/// Cheap to clone; all clones share one underlying database.
#[derive(Clone)]
pub struct Kv {
    db: sled::Db,
}

impl Kv {
    /// Open (or create) the store at the given directory.
    ///
    /// Failure here is fatal to the daemon — there is no degraded mode
    /// without persistence.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory store that vanishes on drop. Test use only.
    pub fn temporary() -> Result<Self, KvError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, bucket: &str) -> Result<sled::Tree, KvError> {
        Ok(self.db.open_tree(bucket)?)
    }

    pub fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.tree(bucket)?.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.tree(bucket)?.get(key)?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, bucket: &str, key: &str) -> Result<(), KvError> {
        self.tree(bucket)?.remove(key)?;
        Ok(())
    }

    pub fn list_keys(&self, bucket: &str) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        for entry in self.tree(bucket)?.iter() {
            let (key, _) = entry?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    pub fn get_all(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let mut entries = Vec::new();
        for entry in self.tree(bucket)?.iter() {
            let (key, value) = entry?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<(), KvError> {
        self.tree(bucket)?.clear()?;
        Ok(())
    }
}
