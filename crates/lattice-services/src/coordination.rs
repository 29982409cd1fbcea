//! Cluster-wide coordination primitives: named FIFO mutexes and the
//! once-per-id fence.
//!
//! Mutex owners are connection ids, which lets the hub bulk-release
//! everything a connection held when it dies. Waiters are an explicit FIFO
//! queue per name; a grant wakes exactly the front waiter. Re-entrant
//! acquisition of the same name by the same owner deadlocks by contract.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use lattice_core::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("attempt to unlock a mutex that is not locked")]
    NotLocked,
    #[error("already taken")]
    AlreadyTaken,
}

impl From<CoordError> for RpcError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::AlreadyTaken => RpcError::AlreadyTaken,
            CoordError::NotLocked => RpcError::internal(err.to_string()),
        }
    }
}

struct Waiter {
    owner: String,
    grant: oneshot::Sender<()>,
}

struct LockEntry {
    holder: Option<String>,
    waiters: VecDeque<Waiter>,
    /// Lock calls not yet matched by an unlock (holder + waiters).
    /// The entry is destroyed when this reaches zero.
    refcount: usize,
}

#[derive(Default)]
struct Tables {
    locks: HashMap<String, LockEntry>,
    /// Owner → names the owner currently holds or waits on.
    owners: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct MutexTable {
    inner: Mutex<Tables>,
}

impl MutexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named mutex, blocking until it is free. Grants are FIFO
    /// by arrival per name.
    pub async fn lock(&self, owner: &str, name: &str) {
        let pending = {
            let mut tables = self.inner.lock().await;
            tables
                .owners
                .entry(owner.to_string())
                .or_default()
                .push(name.to_string());

            let entry = tables.locks.entry(name.to_string()).or_insert(LockEntry {
                holder: None,
                waiters: VecDeque::new(),
                refcount: 0,
            });
            entry.refcount += 1;

            if entry.holder.is_none() && entry.waiters.is_empty() {
                entry.holder = Some(owner.to_string());
                None
            } else {
                let (grant, rx) = oneshot::channel();
                entry.waiters.push_back(Waiter {
                    owner: owner.to_string(),
                    grant,
                });
                Some(rx)
            }
        };

        if let Some(rx) = pending {
            // A dropped sender means the waiter slot was abandoned on
            // disconnect; the caller is gone and the result is moot.
            let _ = rx.await;
        }
    }

    /// Release the named mutex and wake the front waiter. Unlocking a mutex
    /// nobody holds is a programming error and fails loudly.
    pub async fn unlock(&self, owner: &str, name: &str) -> Result<(), CoordError> {
        let mut tables = self.inner.lock().await;
        let entry = tables.locks.get_mut(name).ok_or(CoordError::NotLocked)?;
        if entry.holder.is_none() {
            return Err(CoordError::NotLocked);
        }

        entry.refcount -= 1;
        Self::grant_next(entry);
        if entry.refcount == 0 {
            tables.locks.remove(name);
        }
        Self::forget_owned(&mut tables.owners, owner, name);
        Ok(())
    }

    /// Release every mutex the owner holds and drop its pending waiter
    /// slots. Invoked when the owning connection closes.
    pub async fn unlock_for_owner(&self, owner: &str) {
        let mut tables = self.inner.lock().await;
        let Some(names) = tables.owners.remove(owner) else {
            return;
        };

        for name in names {
            let Some(entry) = tables.locks.get_mut(&name) else {
                continue;
            };
            if entry.holder.as_deref() == Some(owner) {
                entry.refcount -= 1;
                Self::grant_next(entry);
            } else if let Some(pos) = entry.waiters.iter().position(|w| w.owner == owner) {
                // Abandon the FIFO slot; the oneshot sender drops with it.
                entry.waiters.remove(pos);
                entry.refcount -= 1;
            }
            if entry.refcount == 0 {
                tables.locks.remove(&name);
            }
        }
        tracing::debug!(owner, "released all locks for owner");
    }

    /// Name of the current holder, if the mutex exists.
    pub async fn holder(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .locks
            .get(name)
            .and_then(|e| e.holder.clone())
    }

    /// True when no lock or owner book-keeping remains.
    pub async fn is_empty(&self) -> bool {
        let tables = self.inner.lock().await;
        tables.locks.is_empty() && tables.owners.is_empty()
    }

    fn grant_next(entry: &mut LockEntry) {
        match entry.waiters.pop_front() {
            Some(waiter) => {
                entry.holder = Some(waiter.owner.clone());
                let _ = waiter.grant.send(());
            }
            None => entry.holder = None,
        }
    }

    fn forget_owned(owners: &mut HashMap<String, Vec<String>>, owner: &str, name: &str) {
        if let Some(names) = owners.get_mut(owner) {
            if let Some(pos) = names.iter().rposition(|n| n == name) {
                names.remove(pos);
            }
            if names.is_empty() {
                owners.remove(owner);
            }
        }
    }
}

/// Single-winner predicate over an id within a TTL window. Used for
/// cluster-wide single-fire events ("run this migration exactly once").
pub struct OnceFence {
    inner: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl OnceFence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Succeeds iff the id has not been taken within the TTL window.
    pub async fn acquire(&self, id: &str) -> Result<(), CoordError> {
        let mut taken = self.inner.lock().await;
        let now = Instant::now();
        if let Some(at) = taken.get(id) {
            if now.duration_since(*at) < self.ttl {
                return Err(CoordError::AlreadyTaken);
            }
        }
        taken.insert(id.to_string(), now);
        Ok(())
    }

    /// Evict expired ids. The guard is held only for the retain pass.
    pub async fn sweep(&self) -> usize {
        let mut taken = self.inner.lock().await;
        let before = taken.len();
        let now = Instant::now();
        let ttl = self.ttl;
        taken.retain(|_, at| now.duration_since(*at) < ttl);
        before - taken.len()
    }
}
