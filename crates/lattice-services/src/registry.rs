//! Service registry — the membership table of everything connected to the
//! hub, keyed by declared service type.
//!
//! Entries are owned by the registering connection and removed wholesale
//! when that connection dies. Nothing is ever mutated in place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

pub const TYPE_WORKER: &str = "worker";
pub const TYPE_PBX: &str = "PBX";
pub const TYPE_TASK_QUEUE: &str = "taskQueue";
pub const TYPE_CRON: &str = "cron";
pub const TYPE_FILE_STORE: &str = "fileStore";

/// Substituted when a registering peer declares no port.
const DEFAULT_PORT: &str = "1234";

/// One registered peer service.
///
/// `conn_id` is hub-internal and never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(rename = "type")]
    pub service_type: String,
    pub address: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_js: Option<String>,
    #[serde(skip)]
    pub conn_id: String,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Created(Service),
    Updated(Service),
    Deleted(Service),
}

/// Derive the advertised address for a service type from the peer's IP.
/// File stores are fetched over plain HTTP; everything else is dialed back
/// over websockets.
pub fn service_address(service_type: &str, ip: &str) -> String {
    match service_type {
        TYPE_FILE_STORE => format!("http://{ip}"),
        _ => format!("ws://{ip}"),
    }
}

pub struct Registry {
    inner: RwLock<HashMap<String, Vec<Service>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Receive Created/Updated/Deleted events for every mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert a service. Duplicates (same connection, same type) are
    /// distinct entries; insertion order within a type is preserved.
    pub async fn register(
        &self,
        service_type: &str,
        address: String,
        port: String,
        conn_id: &str,
        common_js: Option<String>,
    ) {
        let port = if port.is_empty() {
            match service_type {
                TYPE_WORKER | TYPE_PBX | TYPE_TASK_QUEUE => DEFAULT_PORT.to_string(),
                _ => port,
            }
        } else {
            port
        };

        let service = Service {
            service_type: service_type.to_string(),
            address,
            port,
            common_js,
            conn_id: conn_id.to_string(),
        };

        let mut inner = self.inner.write().await;
        inner
            .entry(service.service_type.clone())
            .or_default()
            .push(service.clone());
        drop(inner);

        tracing::info!(
            service_type,
            address = %service.address,
            port = %service.port,
            conn_id,
            "service registered"
        );
        let _ = self.events.send(RegistryEvent::Created(service));
    }

    /// Remove every service owned by the connection, across all types.
    /// Remaining entries keep their insertion order.
    pub async fn unregister(&self, conn_id: &str) {
        let mut removed = Vec::new();
        let mut inner = self.inner.write().await;
        for services in inner.values_mut() {
            let mut kept = Vec::with_capacity(services.len());
            for service in services.drain(..) {
                if service.conn_id == conn_id {
                    removed.push(service);
                } else {
                    kept.push(service);
                }
            }
            *services = kept;
        }
        drop(inner);

        for service in removed {
            tracing::info!(
                service_type = %service.service_type,
                conn_id,
                "service unregistered"
            );
            let _ = self.events.send(RegistryEvent::Deleted(service));
        }
    }

    /// Deep-copied snapshot grouped by type.
    pub async fn get_all(&self) -> HashMap<String, Vec<Service>> {
        self.inner.read().await.clone()
    }
}
