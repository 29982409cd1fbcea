//! HTTP surface — config reload, bundle filesystems, public key.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use lattice_services::bundle::BundleError;
use lattice_services::stores::StoreSnapshot;

use crate::dispatch::TOPIC_CONFIG;
use crate::ApiState;

// ── /config ───────────────────────────────────────────────────────────────────

/// Full config replace. The body is `{storeName: storeRecord}`; malformed
/// JSON never reaches here — the extractor answers with a 4xx.
pub async fn post_config(
    State(state): State<ApiState>,
    Json(document): Json<StoreSnapshot>,
) -> Response {
    match state.stores.reload(document).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err) => {
            tracing::error!(error = %err, "config reload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "can't persist config").into_response()
        }
    }
}

// ── /lib/ ─────────────────────────────────────────────────────────────────────

pub async fn get_lib_root(State(state): State<ApiState>) -> Response {
    match state.lib_bundle.raw().await {
        Some(raw) => (
            [(
                header::CONTENT_DISPOSITION,
                r#"attachment; filename="lib.zip""#.to_string(),
            )],
            raw,
        )
            .into_response(),
        None => not_found(),
    }
}

pub async fn get_lib_file(State(state): State<ApiState>, Path(path): Path<String>) -> Response {
    let filename = path.rsplit('/').next().unwrap_or(path.as_str()).to_string();
    match state.lib_bundle.file(&path).await {
        Some(contents) => (
            [(
                header::CONTENT_DISPOSITION,
                format!(r#"attachment; filename="{filename}""#),
            )],
            contents,
        )
            .into_response(),
        None => not_found(),
    }
}

/// Replace the lib zip, rebuild the filesystem, republish the config so
/// receivers pick up the new bundle.
pub async fn post_lib(State(state): State<ApiState>, body: Bytes) -> Response {
    match state.lib_bundle.replace(body.to_vec()).await {
        Ok(()) => {
            let snapshot = state.stores.snapshot().await;
            match serde_json::to_value(snapshot) {
                Ok(snapshot) => state.broker.publish(TOPIC_CONFIG, snapshot).await,
                Err(err) => tracing::error!(error = %err, "config snapshot failed"),
            }
            StatusCode::OK.into_response()
        }
        Err(err) => bundle_write_error("lib", err),
    }
}

// ── /assets/ ──────────────────────────────────────────────────────────────────

pub async fn get_assets_root() -> Response {
    not_found()
}

pub async fn get_assets_file(State(state): State<ApiState>, Path(path): Path<String>) -> Response {
    match state.assets_bundle.file(&path).await {
        Some(contents) => contents.into_response(),
        None => not_found(),
    }
}

pub async fn post_assets(State(state): State<ApiState>, body: Bytes) -> Response {
    match state.assets_bundle.replace(body.to_vec()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => bundle_write_error("assets", err),
    }
}

// ── /public-key ───────────────────────────────────────────────────────────────

pub async fn public_key(State(state): State<ApiState>) -> Response {
    state.public_key.clone().into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "file not found").into_response()
}

fn bundle_write_error(which: &str, err: BundleError) -> Response {
    tracing::error!(bundle = which, error = %err, "bundle replace failed");
    match err {
        BundleError::Archive(_) => (StatusCode::BAD_REQUEST, "invalid zip bundle").into_response(),
        BundleError::Io(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "can't write file").into_response()
        }
    }
}

/// Read the public-key blob at startup. A missing file is tolerated — the
/// endpoint then serves an empty body.
pub fn load_public_key(path: &std::path::Path) -> Bytes {
    match std::fs::read(path) {
        Ok(raw) => Bytes::from(raw),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "no public key loaded");
            Bytes::new()
        }
    }
}
