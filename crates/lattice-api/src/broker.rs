//! The message fabric — multiplexes RPC calls and topic subscriptions
//! across every hub connection.
//!
//! Procedures and topics are registered at startup; the connection, and
//! subscriber tables churn at runtime. Each connection owns an ordered
//! outbound queue, so a subscriber observes publishes in publish order.
//! Fan-out is a single attempt: a full or closed queue drops the frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as SyncRwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use lattice_core::wire::Frame;
use lattice_core::RpcError;

pub type ConnId = String;

/// Bound procedure. Receives the calling connection's identity and the raw
/// argument list; shape validation happens inside, at the dispatch boundary.
pub type RpcHandler =
    Arc<dyn Fn(CallCtx) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Builds the initial payload delivered to a new subscriber only.
pub type SnapshotHandler = Arc<dyn Fn(ConnId) -> BoxFuture<'static, Option<Value>> + Send + Sync>;

pub type OpenHandler = Arc<dyn Fn(ConnId) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(ConnId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything a procedure learns about one CALL.
#[derive(Clone)]
pub struct CallCtx {
    pub conn_id: ConnId,
    pub remote_addr: SocketAddr,
    pub uri: String,
    pub args: Vec<Value>,
}

#[derive(Clone)]
pub struct ConnHandle {
    pub tx: mpsc::UnboundedSender<Frame>,
    pub remote_addr: SocketAddr,
}

struct TopicDef {
    on_subscribe: Option<SnapshotHandler>,
}

#[derive(Default)]
struct Callbacks {
    on_open: Option<OpenHandler>,
    on_close: Option<CloseHandler>,
}

#[derive(Default)]
pub struct Broker {
    rpc: SyncRwLock<HashMap<String, RpcHandler>>,
    topics: SyncRwLock<HashMap<String, TopicDef>>,
    callbacks: SyncRwLock<Callbacks>,
    conns: RwLock<HashMap<ConnId, ConnHandle>>,
    subs: RwLock<HashMap<String, HashMap<ConnId, mpsc::UnboundedSender<Frame>>>>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ── Registration (startup) ────────────────────────────────────────────────

    pub fn register_rpc(&self, uri: &str, handler: RpcHandler) {
        self.rpc
            .write()
            .expect("rpc registry poisoned")
            .insert(uri.to_string(), handler);
    }

    pub fn register_topic(&self, topic: &str, on_subscribe: Option<SnapshotHandler>) {
        self.topics
            .write()
            .expect("topic registry poisoned")
            .insert(topic.to_string(), TopicDef { on_subscribe });
    }

    pub fn set_open_callback(&self, callback: OpenHandler) {
        self.callbacks.write().expect("callbacks poisoned").on_open = Some(callback);
    }

    pub fn set_close_callback(&self, callback: CloseHandler) {
        self.callbacks.write().expect("callbacks poisoned").on_close = Some(callback);
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Admit a connection. The open callback runs before any of its RPCs
    /// can dispatch.
    pub async fn add_conn(&self, conn_id: &ConnId, handle: ConnHandle) {
        self.conns
            .write()
            .await
            .insert(conn_id.clone(), handle);
        let on_open = self.callbacks.read().expect("callbacks poisoned").on_open.clone();
        if let Some(on_open) = on_open {
            on_open(conn_id.clone());
        }
    }

    /// Drop a connection: its subscriptions first, then the close callback,
    /// which deterministically unwinds everything the connection owned.
    pub async fn remove_conn(&self, conn_id: &ConnId) {
        self.conns.write().await.remove(conn_id);
        let mut subs = self.subs.write().await;
        for subscribers in subs.values_mut() {
            subscribers.remove(conn_id);
        }
        drop(subs);

        let on_close = self.callbacks.read().expect("callbacks poisoned").on_close.clone();
        if let Some(on_close) = on_close {
            on_close(conn_id.clone()).await;
        }
    }

    pub async fn conn(&self, conn_id: &ConnId) -> Option<ConnHandle> {
        self.conns.read().await.get(conn_id).cloned()
    }

    pub async fn conn_count(&self) -> usize {
        self.conns.read().await.len()
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    pub async fn call(&self, ctx: CallCtx) -> Result<Value, RpcError> {
        let handler = self
            .rpc
            .read()
            .expect("rpc registry poisoned")
            .get(&ctx.uri)
            .cloned();
        match handler {
            Some(handler) => handler(ctx).await,
            None => Err(RpcError::UnknownProcedure),
        }
    }

    // ── Topics ────────────────────────────────────────────────────────────────

    /// Subscribe the connection, returning the topic's initial payload for
    /// delivery to this subscriber only. Unknown topics are ignored.
    pub async fn subscribe(&self, topic: &str, conn_id: &ConnId) -> Option<Value> {
        let on_subscribe = {
            let topics = self.topics.read().expect("topic registry poisoned");
            match topics.get(topic) {
                Some(def) => def.on_subscribe.clone(),
                None => {
                    tracing::debug!(topic, conn_id, "subscribe to unregistered topic ignored");
                    return None;
                }
            }
        };

        let Some(handle) = self.conn(conn_id).await else {
            return None;
        };
        self.subs
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id.clone(), handle.tx);
        tracing::debug!(topic, conn_id, "subscribed");

        match on_subscribe {
            Some(snapshot) => snapshot(conn_id.clone()).await,
            None => None,
        }
    }

    pub async fn unsubscribe(&self, topic: &str, conn_id: &ConnId) {
        if let Some(subscribers) = self.subs.write().await.get_mut(topic) {
            subscribers.remove(conn_id);
        }
    }

    /// Fan the payload out to every current subscriber. Senders are cloned
    /// under the read guard and the sends happen after it drops.
    pub async fn publish(&self, topic: &str, event: Value) {
        let senders: Vec<mpsc::UnboundedSender<Frame>> = {
            let subs = self.subs.read().await;
            match subs.get(topic) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return,
            }
        };

        for sender in senders {
            // Single attempt; a closed queue means the connection is on its
            // way out and cleanup will follow.
            let _ = sender.send(Frame::Event {
                topic: topic.to_string(),
                event: event.clone(),
            });
        }
    }
}
