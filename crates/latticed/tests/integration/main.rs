//! Integration harness — runs the daemon in-process on an ephemeral port
//! and drives it with a minimal websocket client speaking the hub's frame
//! protocol.
//!
//! Each test gets its own daemon and storage directory; nothing is shared
//! between tests.

mod config;
mod coordination;
mod sessions;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lattice_core::wire::Frame;
use lattice_core::LatticeConfig;
use latticed::Daemon;

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct TestHub {
    pub daemon: Daemon,
    dir: PathBuf,
}

impl TestHub {
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.daemon.addr.port())
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.daemon.addr.port(), path)
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub async fn spawn_hub() -> TestHub {
    spawn_hub_with(|_| {}).await
}

pub async fn spawn_hub_with(tweak: impl FnOnce(&mut LatticeConfig)) -> TestHub {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("lattice-it-{}-{}", std::process::id(), id));
    std::fs::create_dir_all(&dir).unwrap();

    let mut config = LatticeConfig::default();
    config.server.port = 0;
    config.server.public_key_path = dir.join("public.key");
    config.storage.data_dir = dir.join("data");
    config.storage.bootstrap_config = dir.join("config.json");
    config.bundles.lib_zip = dir.join("lib.zip");
    config.bundles.assets_zip = dir.join("assets.zip");
    tweak(&mut config);

    let daemon = Daemon::start(config).await.expect("daemon should start");
    TestHub { daemon, dir }
}

// ── Hub client ────────────────────────────────────────────────────────────────

type CallOutcome = Result<Value, (String, String)>;

pub struct HubClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub conn_id: String,
    next_call: u64,
    events: VecDeque<(String, Value)>,
    results: HashMap<String, CallOutcome>,
}

impl HubClient {
    pub async fn connect(hub: &TestHub) -> Self {
        let (stream, _) = connect_async(hub.ws_url())
            .await
            .expect("websocket connect");
        let mut client = Self {
            stream,
            conn_id: String::new(),
            next_call: 0,
            events: VecDeque::new(),
            results: HashMap::new(),
        };
        match client.poll_frame(Duration::from_secs(5)).await {
            Some(Frame::Welcome { conn_id, .. }) => client.conn_id = conn_id,
            other => panic!("expected WELCOME, got {other:?}"),
        }
        client
    }

    async fn send(&mut self, frame: Frame) {
        self.stream
            .send(Message::Text(frame.to_message().into()))
            .await
            .expect("websocket send");
    }

    /// Next parseable frame within the timeout, or None.
    async fn poll_frame(&mut self, wait: Duration) -> Option<Frame> {
        loop {
            let message = match timeout(wait, self.stream.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(err))) => panic!("websocket error: {err}"),
                Ok(None) => return None,
                Err(_) => return None,
            };
            match message {
                Message::Text(text) => {
                    return Some(Frame::parse(text.as_str()).expect("parseable frame"))
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Read one frame into the buffers. False when nothing arrived in time.
    async fn pump_one(&mut self, wait: Duration) -> bool {
        match self.poll_frame(wait).await {
            Some(Frame::Event { topic, event }) => {
                self.events.push_back((topic, event));
                true
            }
            Some(Frame::CallResult { call_id, result }) => {
                self.results.insert(call_id, Ok(result));
                true
            }
            Some(Frame::CallError {
                call_id,
                error_uri,
                description,
            }) => {
                self.results.insert(call_id, Err((error_uri, description)));
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Issue a CALL without waiting for its outcome.
    pub async fn start_call(&mut self, uri: &str, args: Vec<Value>) -> String {
        self.next_call += 1;
        let call_id = format!("call-{}", self.next_call);
        self.send(Frame::Call {
            call_id: call_id.clone(),
            uri: uri.to_string(),
            args,
        })
        .await;
        call_id
    }

    /// CALL and wait for the matching result or error.
    pub async fn call(&mut self, uri: &str, args: Vec<Value>) -> CallOutcome {
        let call_id = self.start_call(uri, args).await;
        loop {
            if let Some(outcome) = self.results.remove(&call_id) {
                return outcome;
            }
            assert!(
                self.pump_one(Duration::from_secs(5)).await,
                "timed out waiting for result of {uri}"
            );
        }
    }

    /// Outcome of a pending call, if it lands within the wait.
    pub async fn try_result(&mut self, call_id: &str, wait: Duration) -> Option<CallOutcome> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(outcome) = self.results.remove(call_id) {
                return Some(outcome);
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() || !self.pump_one(left).await {
                return None;
            }
        }
    }

    pub async fn subscribe(&mut self, topic: &str) {
        self.send(Frame::Subscribe {
            topic: topic.to_string(),
        })
        .await;
    }

    /// Next event on the topic; events on other topics stay buffered.
    pub async fn next_event(&mut self, topic: &str) -> Value {
        if let Some(index) = self.events.iter().position(|(t, _)| t == topic) {
            return self.events.remove(index).unwrap().1;
        }
        loop {
            assert!(
                self.pump_one(Duration::from_secs(5)).await,
                "timed out waiting for event on {topic}"
            );
            if let Some(index) = self.events.iter().position(|(t, _)| t == topic) {
                return self.events.remove(index).unwrap().1;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ── Smoke ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn welcome_assigns_distinct_conn_ids() {
    let hub = spawn_hub().await;
    let a = HubClient::connect(&hub).await;
    let b = HubClient::connect(&hub).await;

    assert!(!a.conn_id.is_empty());
    assert_ne!(a.conn_id, b.conn_id);
}

#[tokio::test]
async fn unknown_procedure_is_an_in_band_error() {
    let hub = spawn_hub().await;
    let mut client = HubClient::connect(&hub).await;

    let (error_uri, _) = client.call("no.such.procedure", vec![]).await.unwrap_err();
    assert_eq!(error_uri, "error.unknown-procedure");

    // The connection survives handler-level errors.
    let result = client.call("localStorage.getItem", vec![Value::String("k".into())]).await;
    assert_eq!(result.unwrap(), Value::Null);
}
