//! Config reload path and the HTTP surface around it.

use std::io::Write;

use serde_json::json;

use crate::{spawn_hub, spawn_hub_with, HubClient};

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn config_reload_fans_out_full_snapshots() {
    let hub = spawn_hub().await;

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("config").await;
    assert_eq!(observer.next_event("config").await, json!({}));

    let http = reqwest::Client::new();
    let response = http
        .post(hub.http_url("/config"))
        .json(&json!({"storeX": {"display": "table"}}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");

    let snapshot = observer.next_event("config").await;
    assert_eq!(snapshot["storeX"]["display"], json!("table"));
    // Records come back stamped with their store name.
    assert_eq!(snapshot["storeX"]["store"], json!("storeX"));

    // Replace-all: an empty document empties the snapshot.
    http.post(hub.http_url("/config"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(observer.next_event("config").await, json!({}));
}

#[tokio::test]
async fn malformed_config_body_is_a_client_error() {
    let hub = spawn_hub().await;
    let http = reqwest::Client::new();

    let response = http
        .post(hub.http_url("/config"))
        .header("content-type", "application/json")
        .body("not json at all")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn bootstrap_config_loads_at_startup() {
    let hub = spawn_hub_with(|config| {
        let path = config.storage.data_dir.with_file_name("bootstrap.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"users": {"display": "list"}}"#).unwrap();
        config.storage.bootstrap_config = path;
    })
    .await;

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("config").await;
    let snapshot = observer.next_event("config").await;
    assert_eq!(snapshot["users"]["display"], json!("list"));
    assert_eq!(snapshot["users"]["store"], json!("users"));
}

#[tokio::test]
async fn lib_bundle_upload_and_fetch() {
    let hub = spawn_hub().await;
    let http = reqwest::Client::new();

    // Nothing is served before an upload.
    let missing = http.get(hub.http_url("/lib/app.js")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("config").await;
    observer.next_event("config").await;

    let raw = zip_bytes(&[("app.js", b"console.log(1)"), ("css/site.css", b"body{}")]);
    let response = http
        .post(hub.http_url("/lib/"))
        .body(raw.clone())
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // A bundle replacement republishes the config.
    observer.next_event("config").await;

    let file = http.get(hub.http_url("/lib/app.js")).send().await.unwrap();
    assert_eq!(file.status(), 200);
    assert_eq!(file.bytes().await.unwrap().as_ref(), b"console.log(1)");

    let nested = http
        .get(hub.http_url("/lib/css/site.css"))
        .send()
        .await
        .unwrap();
    assert_eq!(nested.bytes().await.unwrap().as_ref(), b"body{}");

    // The root serves the raw zip back.
    let whole = http.get(hub.http_url("/lib/")).send().await.unwrap();
    assert_eq!(whole.bytes().await.unwrap().as_ref(), raw.as_slice());
}

#[tokio::test]
async fn assets_bundle_upload_and_fetch() {
    let hub = spawn_hub().await;
    let http = reqwest::Client::new();

    let raw = zip_bytes(&[("logo.svg", b"<svg/>")]);
    http.post(hub.http_url("/assets/"))
        .body(raw)
        .send()
        .await
        .unwrap();

    let file = http
        .get(hub.http_url("/assets/logo.svg"))
        .send()
        .await
        .unwrap();
    assert_eq!(file.status(), 200);
    assert_eq!(file.bytes().await.unwrap().as_ref(), b"<svg/>");

    let garbage = http
        .post(hub.http_url("/assets/"))
        .body(b"not a zip".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 400);
}

#[tokio::test]
async fn public_key_serves_raw_bytes() {
    let hub = spawn_hub_with(|config| {
        std::fs::create_dir_all(config.server.public_key_path.parent().unwrap()).unwrap();
        std::fs::write(&config.server.public_key_path, b"-----KEY-----").unwrap();
    })
    .await;

    let response = reqwest::get(hub.http_url("/public-key")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"-----KEY-----");
}
