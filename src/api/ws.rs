//! # Console WebSocket endpoint.
//!
//! Bridges one WebSocket client onto a fabric [`Subscription`]: frames from
//! the fabric go out as JSON text messages, `command` / `pong` frames come
//! back in. The fabric owns all policy (history, heartbeats, lag
//! disconnects); this layer only translates.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::SinkExt;
use tracing::{debug, warn};

use crate::console::{ClientFrame, Frame};

use super::AppState;

pub async fn console_ws(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, id, socket))
}

async fn handle_socket(state: Arc<AppState>, server_id: i64, mut socket: WebSocket) {
    let mut subscription = match state.supervisor.fabric().subscribe(server_id).await {
        Ok(subscription) => subscription,
        Err(_) => {
            // No console registered: the server has never been started in
            // this supervisor's lifetime.
            let frame = Frame::Error {
                message: "server is not running".into(),
            };
            let _ = send_frame(&mut socket, &frame).await;
            let _ = socket.close().await;
            return;
        }
    };
    let sink_id = subscription.id;
    debug!(server_id, sink_id, "console websocket connected");

    loop {
        tokio::select! {
            // Fabric → client. A closed channel means the sink was
            // disconnected (lag, heartbeat, or child exit).
            frame = subscription.frames.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            // Client → fabric.
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state, server_id, sink_id, &text, &mut socket).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Transport-level liveness also counts.
                    state.supervisor.fabric().pong(server_id, sink_id).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(server_id, error = %err, "websocket receive error");
                    break;
                }
            },
        }
    }

    state.supervisor.fabric().unsubscribe(server_id, sink_id).await;
    let _ = socket.close().await;
    debug!(server_id, sink_id, "console websocket closed");
}

async fn handle_client_text(
    state: &Arc<AppState>,
    server_id: i64,
    sink_id: u64,
    text: &str,
    socket: &mut WebSocket,
) {
    let parsed: Result<ClientFrame, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientFrame::Command { command }) => {
            // Ack goes to the originating socket only.
            let ack = match state.supervisor.send_command(server_id, &command).await {
                Ok(()) => Frame::CommandAck {
                    success: true,
                    command,
                    message: None,
                },
                Err(err) => Frame::CommandAck {
                    success: false,
                    command,
                    message: Some(err.to_string()),
                },
            };
            let _ = send_frame(socket, &ack).await;
        }
        Ok(ClientFrame::Pong) => {
            state.supervisor.fabric().pong(server_id, sink_id).await;
        }
        Err(err) => {
            warn!(server_id, error = %err, "unparseable console frame from client");
            let frame = Frame::Error {
                message: "unrecognized frame".into(),
            };
            let _ = send_frame(socket, &frame).await;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("console frames always serialize");
    socket.send(Message::Text(text.into())).await
}
