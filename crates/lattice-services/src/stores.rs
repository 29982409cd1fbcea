//! Config store cache — custody of the last validated configuration.
//!
//! A config document maps store names to opaque store records. Reload is
//! replace-all: the bucket is cleared, every record is rewritten, and only
//! then does the in-memory snapshot swap and the change event fire —
//! subscribers see the old map or the new one, never a partial mix.
//!
//! Full schema validation of records happens upstream; the hub only stamps
//! each record with its store name before persisting.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::kv::{Kv, KvError, STORES_BUCKET};

pub type StoreSnapshot = HashMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] KvError),
    #[error("store record: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct StoreCache {
    kv: Kv,
    cache: RwLock<StoreSnapshot>,
    events: broadcast::Sender<StoreSnapshot>,
}

impl StoreCache {
    /// Open against the persisted snapshot from the last reload.
    pub fn open(kv: Kv) -> Result<Self, StoreError> {
        let cache = read_bucket(&kv)?;
        if !cache.is_empty() {
            tracing::info!(stores = cache.len(), "config stores recovered");
        }
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            kv,
            cache: RwLock::new(cache),
            events,
        })
    }

    /// Receive the full finalized map after every reload.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreSnapshot> {
        self.events.subscribe()
    }

    /// Replace the whole configuration. The event fires only after every
    /// record is persisted.
    pub async fn reload(&self, raw: StoreSnapshot) -> Result<(), StoreError> {
        let normalized = normalize(raw);

        self.kv.delete_bucket(STORES_BUCKET)?;
        for (name, record) in &normalized {
            self.kv
                .put(STORES_BUCKET, name, &serde_json::to_vec(record)?)?;
        }

        *self.cache.write().await = normalized.clone();
        tracing::info!(stores = normalized.len(), "config reloaded");
        let _ = self.events.send(normalized);
        Ok(())
    }

    /// Current in-memory snapshot.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.cache.read().await.clone()
    }

    /// Snapshot re-read from storage. Serves the initial payload of config
    /// subscribers.
    pub fn snapshot_from_db(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(read_bucket(&self.kv)?)
    }
}

fn read_bucket(kv: &Kv) -> Result<StoreSnapshot, KvError> {
    let mut snapshot = StoreSnapshot::new();
    for (name, raw) in kv.get_all(STORES_BUCKET)? {
        match serde_json::from_slice(&raw) {
            Ok(record) => {
                snapshot.insert(name, record);
            }
            Err(err) => {
                tracing::error!(store = %name, error = %err, "skipping unreadable store record");
            }
        }
    }
    Ok(snapshot)
}

/// Stamp each record with the store name it lives under.
fn normalize(raw: StoreSnapshot) -> StoreSnapshot {
    raw.into_iter()
        .map(|(name, mut record)| {
            if let Some(fields) = record.as_object_mut() {
                fields.insert("store".to_string(), Value::String(name.clone()));
            }
            (name, record)
        })
        .collect()
}
