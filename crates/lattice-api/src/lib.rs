//! lattice-api — the hub's single-port surface: websocket fabric at `/`
//! and the HTTP endpoints beside it.

pub mod broker;
pub mod connection;
pub mod dispatch;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use lattice_services::{
    BundleFs, LocalStorage, MutexTable, OnceFence, Registry, SessionStore, StoreCache,
};

pub use broker::Broker;

/// Everything the surface needs, shared by ws and HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionStore>,
    pub mutexes: Arc<MutexTable>,
    pub once: Arc<OnceFence>,
    pub local_storage: LocalStorage,
    pub stores: Arc<StoreCache>,
    pub lib_bundle: Arc<BundleFs>,
    pub assets_bundle: Arc<BundleFs>,
    pub public_key: Bytes,
}

pub fn app(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws_upgrade))
        .route("/config", post(handlers::post_config))
        .route(
            "/lib/",
            get(handlers::get_lib_root).post(handlers::post_lib),
        )
        .route("/lib/{*path}", get(handlers::get_lib_file))
        .route(
            "/assets/",
            get(handlers::get_assets_root).post(handlers::post_assets),
        )
        .route("/assets/{*path}", get(handlers::get_assets_file))
        .route("/public-key", get(handlers::public_key))
        .layer(DefaultBodyLimit::max(256 * 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<ApiState>,
) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, remote_addr, state))
}

pub async fn serve(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
