//! Per-connection websocket loop.
//!
//! One task per connection: it drains the ordered outbound queue and the
//! inbound socket. Every CALL dispatches on its own task so a blocked
//! handler (a contended `sync.lock`) never stalls this loop; the result
//! frame re-enters the outbound queue whenever the handler finishes.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use lattice_core::wire::Frame;

use crate::broker::{CallCtx, ConnHandle, ConnId};
use crate::ApiState;

const SERVER_IDENT: &str = concat!("lattice/", env!("CARGO_PKG_VERSION"));

pub async fn handle_socket(socket: WebSocket, remote_addr: SocketAddr, state: ApiState) {
    let conn_id: ConnId = Uuid::new_v4().to_string();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Frame>();

    state
        .broker
        .add_conn(
            &conn_id,
            ConnHandle {
                tx: tx.clone(),
                remote_addr,
            },
        )
        .await;
    tracing::info!(conn_id, %remote_addr, "client connected");

    let _ = tx.send(Frame::Welcome {
        conn_id: conn_id.clone(),
        server_ident: SERVER_IDENT.to_string(),
    });

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx
                    .send(Message::Text(frame.to_message().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &conn_id, remote_addr, &tx, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(conn_id, error = %err, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    // Deterministic unwind: registry entries and held mutexes go with us.
    state.broker.remove_conn(&conn_id).await;
    tracing::info!(conn_id, "client disconnected");
}

async fn handle_frame(
    state: &ApiState,
    conn_id: &ConnId,
    remote_addr: SocketAddr,
    tx: &mpsc::UnboundedSender<Frame>,
    text: &str,
) {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(conn_id, error = %err, "unparseable frame dropped");
            return;
        }
    };

    match frame {
        Frame::Call { call_id, uri, args } => {
            let ctx = CallCtx {
                conn_id: conn_id.clone(),
                remote_addr,
                uri,
                args,
            };
            let broker = state.broker.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match broker.call(ctx).await {
                    Ok(result) => Frame::CallResult { call_id, result },
                    Err(err) => Frame::CallError {
                        call_id,
                        error_uri: err.uri().to_string(),
                        description: err.to_string(),
                    },
                };
                let _ = tx.send(reply);
            });
        }
        Frame::Subscribe { topic } => {
            if let Some(initial) = state.broker.subscribe(&topic, conn_id).await {
                let _ = tx.send(Frame::Event {
                    topic,
                    event: initial,
                });
            }
        }
        Frame::Unsubscribe { topic } => {
            state.broker.unsubscribe(&topic, conn_id).await;
        }
        Frame::Publish { topic, event } => {
            state.broker.publish(&topic, event).await;
        }
        other => {
            tracing::debug!(conn_id, frame = ?other, "unexpected frame from client");
        }
    }
}
