//! latticed — daemon assembly.
//!
//! Builds the services, binds the fabric's procedures and topics, spawns
//! the event pumps and TTL sweepers, and serves everything on one port.
//! Exposed as a library so integration tests run the daemon in-process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use lattice_api::dispatch::{self, TOPIC_CONFIG, TOPIC_REGISTRY, TOPIC_SESSIONS};
use lattice_api::{handlers, ApiState, Broker};
use lattice_core::LatticeConfig;
use lattice_services::stores::StoreSnapshot;
use lattice_services::{
    registry, BundleFs, Kv, LocalStorage, MutexTable, OnceFence, Registry, RegistryEvent,
    SessionEvent, SessionStore, StoreCache,
};

/// A running hub. Dropping it aborts every background task.
pub struct Daemon {
    pub addr: SocketAddr,
    pub state: ApiState,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Daemon {
    pub async fn start(config: LatticeConfig) -> Result<Daemon> {
        // Storage first: without it there is no session custody and the
        // daemon has no business starting.
        let kv = Kv::open(&config.storage.data_dir).context("failed to open key/value store")?;

        let sessions = Arc::new(
            SessionStore::open(
                kv.clone(),
                Duration::from_secs(config.sessions.ttl_secs),
                Duration::from_secs(config.sessions.ephemeral_ttl_secs),
            )
            .context("failed to recover sessions")?,
        );
        let stores =
            Arc::new(StoreCache::open(kv.clone()).context("failed to recover config stores")?);
        let registry = Arc::new(Registry::new());
        let mutexes = Arc::new(MutexTable::new());
        let once = Arc::new(OnceFence::new(Duration::from_secs(
            config.coordination.once_ttl_secs,
        )));

        let lib_bundle = Arc::new(BundleFs::new(&config.bundles.lib_zip));
        if let Err(err) = lib_bundle.load().await {
            tracing::warn!(error = %err, "no lib bundle loaded");
        }
        let assets_bundle = Arc::new(BundleFs::new(&config.bundles.assets_zip));
        if let Err(err) = assets_bundle.load().await {
            tracing::warn!(error = %err, "no assets bundle loaded");
        }

        let broker = Broker::new();
        let state = ApiState {
            broker: broker.clone(),
            registry: registry.clone(),
            sessions: sessions.clone(),
            mutexes: mutexes.clone(),
            once: once.clone(),
            local_storage: LocalStorage::new(),
            stores: stores.clone(),
            lib_bundle,
            assets_bundle,
            public_key: handlers::load_public_key(&config.server.public_key_path),
        };

        dispatch::register_rpcs(&state);
        dispatch::register_topics(&state);

        broker.set_open_callback(Arc::new(|conn_id| {
            tracing::debug!(conn_id, "hub connection opened");
        }));
        {
            let registry = registry.clone();
            let mutexes = mutexes.clone();
            broker.set_close_callback(Arc::new(move |conn_id| {
                let registry = registry.clone();
                let mutexes = mutexes.clone();
                async move {
                    registry.unregister(&conn_id).await;
                    mutexes.unlock_for_owner(&conn_id).await;
                }
                .boxed()
            }));
        }

        let mut tasks = vec![
            spawn_registry_pump(broker.clone(), registry.clone(), sessions.clone()),
            spawn_session_pump(broker.clone(), sessions.clone()),
            spawn_store_pump(broker.clone(), stores.clone()),
            spawn_session_sweeper(
                sessions.clone(),
                Duration::from_secs(config.sessions.sweep_interval_secs),
            ),
            spawn_once_sweeper(once.clone()),
        ];

        // Bootstrap config goes through the ordinary reload path so the
        // bucket and snapshot agree from the first request on.
        let bootstrap = &config.storage.bootstrap_config;
        if bootstrap.exists() {
            let text = std::fs::read_to_string(bootstrap)
                .with_context(|| format!("failed to read {}", bootstrap.display()))?;
            let document: StoreSnapshot = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", bootstrap.display()))?;
            stores
                .reload(document)
                .await
                .context("failed to load bootstrap config")?;
        } else {
            tracing::info!(
                path = %bootstrap.display(),
                "no bootstrap config, working with saved stores"
            );
        }

        let listener = TcpListener::bind(("0.0.0.0", config.server.port))
            .await
            .with_context(|| format!("failed to bind port {}", config.server.port))?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "hub listening");

        {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = lattice_api::serve(listener, state).await {
                    tracing::error!(error = %err, "hub server failed");
                }
            }));
        }

        Ok(Daemon { addr, state, tasks })
    }
}

// ── Event pumps ───────────────────────────────────────────────────────────────

/// Registry changes → full snapshot on the registry topic. A deleted
/// taskQueue service means the task router restarted: every live connection
/// in the session store is stale and gets dropped first.
fn spawn_registry_pump(
    broker: Arc<Broker>,
    registry: Arc<Registry>,
    sessions: Arc<SessionStore>,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let RegistryEvent::Deleted(service) = &event {
                        if service.service_type == registry::TYPE_TASK_QUEUE {
                            if let Err(err) = sessions.delete_all_connections().await {
                                tracing::error!(error = %err, "failed to drop stale connections");
                            }
                        }
                    }
                    match serde_json::to_value(registry.get_all().await) {
                        Ok(snapshot) => broker.publish(TOPIC_REGISTRY, snapshot).await,
                        Err(err) => tracing::error!(error = %err, "registry snapshot failed"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "registry pump lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_session_pump(broker: Arc<Broker>, sessions: Arc<SessionStore>) -> JoinHandle<()> {
    let mut events = sessions.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let (kind, session) = match event {
                        SessionEvent::Updated(s) => ("updated", s),
                        SessionEvent::Deleted(s) => ("deleted", s),
                    };
                    match serde_json::to_value(&session) {
                        Ok(data) => {
                            broker
                                .publish(
                                    TOPIC_SESSIONS,
                                    serde_json::json!({"event": kind, "data": data}),
                                )
                                .await
                        }
                        Err(err) => tracing::error!(error = %err, "session snapshot failed"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session pump lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_store_pump(broker: Arc<Broker>, stores: Arc<StoreCache>) -> JoinHandle<()> {
    let mut events = stores.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(snapshot) => {
                    tracing::info!("config updated, publishing to receivers");
                    match serde_json::to_value(snapshot) {
                        Ok(snapshot) => broker.publish(TOPIC_CONFIG, snapshot).await,
                        Err(err) => tracing::error!(error = %err, "config snapshot failed"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "config pump lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ── Sweepers ──────────────────────────────────────────────────────────────────

fn spawn_session_sweeper(sessions: Arc<SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if let Err(err) = sessions.sweep().await {
                tracing::error!(error = %err, "session sweep failed");
            }
        }
    })
}

fn spawn_once_sweeper(once: Arc<OnceFence>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = once.sweep().await;
            if evicted > 0 {
                tracing::debug!(evicted, "once fence swept");
            }
        }
    })
}
