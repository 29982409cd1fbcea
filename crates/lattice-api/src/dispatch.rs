//! RPC surface — binds every procedure uri to its service, with typed
//! request records parsed and validated at the dispatch boundary.
//!
//! Handlers receive the raw argument list from the wire; each request type
//! below owns the arity and shape checks, so the service layer only ever
//! sees well-formed input.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map, Value};

use lattice_core::RpcError;
use lattice_services::registry;

use crate::broker::CallCtx;
use crate::ApiState;

/// Topic names with hub-driven fan-out.
pub const TOPIC_REGISTRY: &str = "registry";
pub const TOPIC_CONFIG: &str = "config";
pub const TOPIC_SESSIONS: &str = "sessions";
pub const TOPIC_EVENTS: &str = "events";
pub const TOPIC_USERS: &str = "users";

// ── Request records ───────────────────────────────────────────────────────────

/// `register` — `{type, port?, commonJS?}`.
struct RegisterRequest {
    service_type: String,
    port: String,
    common_js: Option<String>,
}

impl RegisterRequest {
    fn parse(args: &[Value]) -> Result<Self, RpcError> {
        let fields = arg_object(args, 0)?;
        let service_type = fields
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(RpcError::InvalidArguments)?
            .to_string();
        let port = fields
            .get("port")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let common_js = fields
            .get("commonJS")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            service_type,
            port,
            common_js,
        })
    }
}

/// `publish` — `uri, event, [connId…]`.
struct PublishRequest {
    uri: String,
    event: Value,
    subscribers: Value,
}

impl PublishRequest {
    fn parse(args: &[Value]) -> Result<Self, RpcError> {
        let uri = arg_str(args, 0)?.to_string();
        let event = args.get(1).cloned().unwrap_or(Value::Null);
        let subscribers = args.get(2).cloned().ok_or(RpcError::InvalidArguments)?;
        if !subscribers.is_array() {
            return Err(RpcError::InvalidArguments);
        }
        Ok(Self {
            uri,
            event,
            subscribers,
        })
    }
}

/// `session.subscribed` — `apiKey, connId, uri, extra`.
struct SubscribedRequest {
    api_key: String,
    conn_id: String,
    uri: String,
    extra: Value,
}

impl SubscribedRequest {
    fn parse(args: &[Value]) -> Result<Self, RpcError> {
        if args.len() < 4 {
            return Err(RpcError::InvalidArguments);
        }
        Ok(Self {
            api_key: arg_str(args, 0)?.to_string(),
            conn_id: arg_str(args, 1)?.to_string(),
            uri: arg_str(args, 2)?.to_string(),
            extra: args[3].clone(),
        })
    }
}

fn arg_str(args: &[Value], index: usize) -> Result<&str, RpcError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or(RpcError::InvalidArguments)
}

fn arg_object(args: &[Value], index: usize) -> Result<&Map<String, Value>, RpcError> {
    args.get(index)
        .and_then(Value::as_object)
        .ok_or(RpcError::InvalidArguments)
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Bind every procedure. Call once at startup, before serving.
pub fn register_rpcs(state: &ApiState) {
    let broker = &state.broker;

    // registry ------------------------------------------------------------

    {
        let registry = state.registry.clone();
        broker.register_rpc(
            "register",
            Arc::new(move |ctx: CallCtx| {
                let registry = registry.clone();
                async move {
                    let req = RegisterRequest::parse(&ctx.args)?;
                    let ip = ctx.remote_addr.ip().to_string();
                    let address = registry::service_address(&req.service_type, &ip);
                    registry
                        .register(&req.service_type, address, req.port, &ctx.conn_id, req.common_js)
                        .await;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    // events re-broadcast --------------------------------------------------

    {
        let broker_handle = state.broker.clone();
        broker.register_rpc(
            "publish",
            Arc::new(move |ctx: CallCtx| {
                let broker_handle = broker_handle.clone();
                async move {
                    let req = PublishRequest::parse(&ctx.args)?;
                    broker_handle
                        .publish(
                            TOPIC_EVENTS,
                            json!({
                                "uri": req.uri,
                                "event": req.event,
                                "subscribers": req.subscribers,
                            }),
                        )
                        .await;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    // sessions -------------------------------------------------------------

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.new",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    let user_id = arg_str(&ctx.args, 0)?.to_string();
                    let user = ctx.args.get(1).filter(|v| !v.is_null()).cloned();
                    let session = sessions.create(&user_id, user, false).await?;
                    Ok(Value::String(session.api_key))
                }
                .boxed()
            }),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.check",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    let api_key = arg_str(&ctx.args, 0)?;
                    let session = sessions.get_by_api_key(api_key).await?;
                    Ok(Value::String(session.user_id))
                }
                .boxed()
            }),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.delete",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    let api_key = arg_str(&ctx.args, 0)?;
                    sessions.delete(api_key).await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.subscribed",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    let req = SubscribedRequest::parse(&ctx.args)?;
                    sessions
                        .add_subscription(&req.api_key, &req.conn_id, &req.uri, req.extra)
                        .await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.unsubscribed",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    if ctx.args.len() < 3 {
                        return Err(RpcError::InvalidArguments);
                    }
                    let api_key = arg_str(&ctx.args, 0)?;
                    let conn_id = arg_str(&ctx.args, 1)?;
                    let uri = arg_str(&ctx.args, 2)?;
                    sessions.delete_subscription(api_key, conn_id, uri).await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.delete-connection",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    if ctx.args.len() < 2 {
                        return Err(RpcError::InvalidArguments);
                    }
                    let api_key = arg_str(&ctx.args, 0)?;
                    let conn_id = arg_str(&ctx.args, 1)?;
                    sessions.delete_connection(api_key, conn_id).await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_rpc(
            "session.user-update",
            Arc::new(move |ctx: CallCtx| {
                let sessions = sessions.clone();
                async move {
                    let user_id = arg_str(&ctx.args, 0)?.to_string();
                    match ctx.args.get(1) {
                        // One-arg form purges every session of the user.
                        None => sessions.delete_all_for_user(&user_id).await?,
                        Some(user) => sessions.update_user(&user_id, user.clone()).await?,
                    }
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    // coordination ---------------------------------------------------------

    for uri in ["sync.lock", "mutex.lock"] {
        let mutexes = state.mutexes.clone();
        broker.register_rpc(
            uri,
            Arc::new(move |ctx: CallCtx| {
                let mutexes = mutexes.clone();
                async move {
                    let name = arg_str(&ctx.args, 0)?;
                    mutexes.lock(&ctx.conn_id, name).await;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    for uri in ["sync.unlock", "mutex.unlock"] {
        let mutexes = state.mutexes.clone();
        broker.register_rpc(
            uri,
            Arc::new(move |ctx: CallCtx| {
                let mutexes = mutexes.clone();
                async move {
                    let name = arg_str(&ctx.args, 0)?;
                    mutexes.unlock(&ctx.conn_id, name).await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    {
        let once = state.once.clone();
        broker.register_rpc(
            "sync.once",
            Arc::new(move |ctx: CallCtx| {
                let once = once.clone();
                async move {
                    let id = arg_str(&ctx.args, 0)?;
                    once.acquire(id).await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    // local storage ---------------------------------------------------------

    {
        let storage = state.local_storage.clone();
        broker.register_rpc(
            "localStorage.getItem",
            Arc::new(move |ctx: CallCtx| {
                let storage = storage.clone();
                async move {
                    let key = arg_str(&ctx.args, 0)?;
                    Ok(storage
                        .get_item(key)
                        .map(Value::String)
                        .unwrap_or(Value::Null))
                }
                .boxed()
            }),
        );
    }

    {
        let storage = state.local_storage.clone();
        broker.register_rpc(
            "localStorage.setItem",
            Arc::new(move |ctx: CallCtx| {
                let storage = storage.clone();
                async move {
                    if ctx.args.len() < 2 {
                        return Err(RpcError::InvalidArguments);
                    }
                    let key = arg_str(&ctx.args, 0)?;
                    let value = arg_str(&ctx.args, 1)?;
                    Ok(Value::String(storage.set_item(key, value)))
                }
                .boxed()
            }),
        );
    }

    {
        let storage = state.local_storage.clone();
        broker.register_rpc(
            "localStorage.removeItem",
            Arc::new(move |ctx: CallCtx| {
                let storage = storage.clone();
                async move {
                    let key = arg_str(&ctx.args, 0)?;
                    storage.remove_item(key);
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }

    {
        let storage = state.local_storage.clone();
        broker.register_rpc(
            "localStorage.clear",
            Arc::new(move |_ctx: CallCtx| {
                let storage = storage.clone();
                async move {
                    storage.clear();
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
    }
}

/// Declare every topic and its initial-snapshot payload.
pub fn register_topics(state: &ApiState) {
    let broker = &state.broker;

    {
        let registry = state.registry.clone();
        broker.register_topic(
            TOPIC_REGISTRY,
            Some(Arc::new(move |_conn| {
                let registry = registry.clone();
                async move {
                    match serde_json::to_value(registry.get_all().await) {
                        Ok(snapshot) => Some(snapshot),
                        Err(err) => {
                            tracing::error!(error = %err, "registry snapshot failed");
                            None
                        }
                    }
                }
                .boxed()
            })),
        );
    }

    {
        let stores = state.stores.clone();
        broker.register_topic(
            TOPIC_CONFIG,
            Some(Arc::new(move |_conn| {
                let stores = stores.clone();
                async move {
                    match stores.snapshot_from_db() {
                        Ok(snapshot) => serde_json::to_value(snapshot).ok(),
                        Err(err) => {
                            tracing::error!(error = %err, "config snapshot failed");
                            None
                        }
                    }
                }
                .boxed()
            })),
        );
    }

    {
        let sessions = state.sessions.clone();
        broker.register_topic(
            TOPIC_SESSIONS,
            Some(Arc::new(move |_conn| {
                let sessions = sessions.clone();
                async move {
                    Some(json!({
                        "event": "init",
                        "data": sessions.get_all().await,
                    }))
                }
                .boxed()
            })),
        );
    }

    broker.register_topic(TOPIC_EVENTS, None);
    broker.register_topic(TOPIC_USERS, None);
}
