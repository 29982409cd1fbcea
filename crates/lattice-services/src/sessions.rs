//! Session store — api-key-scoped user sessions and their cross-connection
//! subscription graph.
//!
//! Sessions survive hub restarts: every mutation persists the full record
//! under its api key, and the emitted change event follows the write, so
//! per-session event order matches storage order. TTL expiry is silent —
//! neither the startup recovery pass nor the sweeper fires handlers.
//!
//! Ephemeral sessions carry a short TTL and are promoted on first lookup:
//! the flag clears and the api key is re-minted, so a single-use key can
//! never be replayed.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use lattice_core::RpcError;

use crate::kv::{Kv, KvError, SESSIONS_BUCKET};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error(transparent)]
    Storage(#[from] KvError),
    #[error("session record: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => RpcError::NotFound,
            other => RpcError::internal(other.to_string()),
        }
    }
}

/// One user session. Shared by every connection presenting its api key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub api_key: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default)]
    pub connections: Vec<SessionConn>,
    pub last_request: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
}

/// One live connection inside a session, with its open subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConn {
    pub conn_id: String,
    #[serde(default)]
    pub subscriptions: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A deep copy of the session. The `user` field is present only when
    /// the user blob itself changed.
    Updated(Session),
    /// The full session as it was at deletion.
    Deleted(Session),
}

pub struct SessionStore {
    inner: RwLock<HashMap<String, Session>>,
    kv: Kv,
    events: broadcast::Sender<SessionEvent>,
    ttl: Duration,
    ephemeral_ttl: Duration,
}

impl SessionStore {
    /// Load persisted sessions and silently drop those already past the
    /// long TTL.
    pub fn open(
        kv: Kv,
        ttl: std::time::Duration,
        ephemeral_ttl: std::time::Duration,
    ) -> Result<Self, SessionError> {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(24));
        let ephemeral_ttl =
            Duration::from_std(ephemeral_ttl).unwrap_or_else(|_| Duration::minutes(1));

        let mut sessions = HashMap::new();
        let now = Utc::now();
        for (key, raw) in kv.get_all(SESSIONS_BUCKET)? {
            let session: Session = match serde_json::from_slice(&raw) {
                Ok(s) => s,
                Err(err) => {
                    tracing::error!(key, error = %err, "dropping unreadable session record");
                    kv.delete(SESSIONS_BUCKET, &key)?;
                    continue;
                }
            };
            if now - session.last_request > ttl {
                kv.delete(SESSIONS_BUCKET, &session.api_key)?;
                continue;
            }
            sessions.insert(session.api_key.clone(), session);
        }
        tracing::info!(count = sessions.len(), "sessions recovered");

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: RwLock::new(sessions),
            kv,
            events,
            ttl,
            ephemeral_ttl,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a session. Ephemeral sessions live one short TTL unless
    /// promoted by a lookup.
    pub async fn create(
        &self,
        user_id: &str,
        user: Option<Value>,
        ephemeral: bool,
    ) -> Result<Session, SessionError> {
        let session = Session {
            api_key: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user,
            connections: Vec::new(),
            last_request: Utc::now(),
            ephemeral,
        };
        self.inner
            .write()
            .await
            .insert(session.api_key.clone(), session.clone());

        // The user blob is new information: emit it.
        self.persist(&session)?;
        let _ = self.events.send(SessionEvent::Updated(session.clone()));
        Ok(session)
    }

    /// Look up by api key. Touches the last-request timestamp and performs
    /// the ephemeral→standard promotion, re-minting the key.
    pub async fn get_by_api_key(&self, api_key: &str) -> Result<Session, SessionError> {
        let mut inner = self.inner.write().await;
        let mut session = inner.remove(api_key).ok_or(SessionError::NotFound)?;

        session.last_request = Utc::now();
        let promoted = session.ephemeral;
        if promoted {
            session.ephemeral = false;
            session.api_key = Uuid::new_v4().to_string();
        }
        inner.insert(session.api_key.clone(), session.clone());
        drop(inner);

        if promoted {
            self.kv.delete(SESSIONS_BUCKET, api_key)?;
            tracing::debug!(user_id = %session.user_id, "ephemeral session promoted");
        }
        self.persist(&session)?;
        let _ = self.events.send(SessionEvent::Updated(elide_user(session.clone())));
        Ok(session)
    }

    /// First session belonging to the user, if any. No touch, no event.
    pub async fn get_by_user_id(&self, user_id: &str) -> Result<Session, SessionError> {
        self.inner
            .read()
            .await
            .values()
            .find(|s| s.user_id == user_id)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    pub async fn get_all(&self) -> Vec<Session> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, api_key: &str) -> Result<(), SessionError> {
        let session = self
            .inner
            .write()
            .await
            .remove(api_key)
            .ok_or(SessionError::NotFound)?;
        self.kv.delete(SESSIONS_BUCKET, api_key)?;
        let _ = self.events.send(SessionEvent::Deleted(session));
        Ok(())
    }

    /// Remove every session of the user, firing a delete event per session.
    pub async fn delete_all_for_user(&self, user_id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let keys: Vec<String> = inner
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.api_key.clone())
            .collect();
        let removed: Vec<Session> = keys.iter().filter_map(|k| inner.remove(k)).collect();
        drop(inner);

        for session in removed {
            self.kv.delete(SESSIONS_BUCKET, &session.api_key)?;
            let _ = self.events.send(SessionEvent::Deleted(session));
        }
        Ok(())
    }

    /// Rewrite the user blob of every matching session. Update events carry
    /// the new payload.
    pub async fn update_user(&self, user_id: &str, user: Value) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let mut changed = Vec::new();
        for session in inner.values_mut() {
            if session.user_id == user_id {
                session.user = Some(user.clone());
                session.last_request = Utc::now();
                changed.push(session.clone());
            }
        }
        drop(inner);

        for session in changed {
            self.persist(&session)?;
            let _ = self.events.send(SessionEvent::Updated(session));
        }
        Ok(())
    }

    /// Record a subscription under the session's connection, creating the
    /// connection record on first use.
    pub async fn add_subscription(
        &self,
        api_key: &str,
        conn_id: &str,
        uri: &str,
        extra: Value,
    ) -> Result<(), SessionError> {
        self.mutate(api_key, |session| {
            let conn = match session.connections.iter_mut().find(|c| c.conn_id == conn_id) {
                Some(conn) => conn,
                None => {
                    session.connections.push(SessionConn {
                        conn_id: conn_id.to_string(),
                        subscriptions: HashMap::new(),
                    });
                    session.connections.last_mut().expect("just pushed")
                }
            };
            conn.subscriptions.insert(uri.to_string(), extra);
        })
        .await
    }

    /// Drop one subscription. A connection record with no subscriptions
    /// left is erased.
    pub async fn delete_subscription(
        &self,
        api_key: &str,
        conn_id: &str,
        uri: &str,
    ) -> Result<(), SessionError> {
        self.mutate(api_key, |session| {
            if let Some(conn) = session.connections.iter_mut().find(|c| c.conn_id == conn_id) {
                conn.subscriptions.remove(uri);
            }
            session
                .connections
                .retain(|c| c.conn_id != conn_id || !c.subscriptions.is_empty());
        })
        .await
    }

    /// Erase a connection record and all its subscriptions.
    pub async fn delete_connection(&self, api_key: &str, conn_id: &str) -> Result<(), SessionError> {
        self.mutate(api_key, |session| {
            session.connections.retain(|c| c.conn_id != conn_id);
        })
        .await
    }

    /// Clear the connection list of every session. Used when the task
    /// router restarts and all subscription state is stale.
    pub async fn delete_all_connections(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let mut changed = Vec::new();
        for session in inner.values_mut() {
            if !session.connections.is_empty() {
                session.connections.clear();
                session.last_request = Utc::now();
                changed.push(session.clone());
            }
        }
        drop(inner);

        for session in changed {
            self.persist(&session)?;
            let _ = self.events.send(SessionEvent::Updated(elide_user(session)));
        }
        Ok(())
    }

    /// Delete sessions past their applicable TTL. Silent: no events.
    pub async fn sweep(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .values()
            .filter(|s| {
                let ttl = if s.ephemeral { self.ephemeral_ttl } else { self.ttl };
                now - s.last_request > ttl
            })
            .map(|s| s.api_key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        drop(inner);

        for key in &expired {
            self.kv.delete(SESSIONS_BUCKET, key)?;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions removed");
        }
        Ok(expired.len())
    }

    async fn mutate(
        &self,
        api_key: &str,
        apply: impl FnOnce(&mut Session),
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let session = inner.get_mut(api_key).ok_or(SessionError::NotFound)?;
        apply(session);
        session.last_request = Utc::now();
        let snapshot = session.clone();
        drop(inner);

        self.persist(&snapshot)?;
        let _ = self.events.send(SessionEvent::Updated(elide_user(snapshot)));
        Ok(())
    }

    fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let raw = serde_json::to_vec(session)?;
        self.kv.put(SESSIONS_BUCKET, &session.api_key, &raw)?;
        Ok(())
    }
}

/// Copy for broadcast with the user blob withheld — it is only published
/// when it changed.
fn elide_user(mut session: Session) -> Session {
    session.user = None;
    session
}
