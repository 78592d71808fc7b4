use std::sync::Arc;

use atelier_core::generation::validate_task_id;
use atelier_core::progress_events::{
    MSG_TYPE_PING, MSG_TYPE_PONG, MSG_TYPE_SUBSCRIBE, MSG_TYPE_UNSUBSCRIBE,
};
use atelier_pipeline::progress::{ProgressMessage, ProgressRouter, ProgressSink};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::state::AppState;
use crate::ws::manager::WsManager;

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.ws_manager, state.progress))
}

/// A parsed inbound client frame.
#[derive(Debug, PartialEq, Eq)]
enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
    Ping,
}

/// Parse `{type, taskId?}`. Anything unrecognised is `None` and dropped.
fn parse_command(text: &str) -> Option<ClientCommand> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    let task_id = || {
        value
            .get("taskId")
            .and_then(Value::as_str)
            .filter(|id| validate_task_id(id).is_ok())
            .map(str::to_string)
    };

    match kind {
        MSG_TYPE_SUBSCRIBE => task_id().map(ClientCommand::Subscribe),
        MSG_TYPE_UNSUBSCRIBE => task_id().map(ClientCommand::Unsubscribe),
        MSG_TYPE_PING => Some(ClientCommand::Ping),
        _ => None,
    }
}

fn encode(message: &ProgressMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode progress message");
            None
        }
    }
}

/// Manage one client connection after upgrade.
///
/// One progress sink per connection carries every task it subscribes to;
/// a single writer task drains both that sink and the manager's frame
/// channel (pings, pongs, close).
async fn handle_socket(socket: WebSocket, ws_manager: Arc<WsManager>, progress: Arc<ProgressRouter>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let mut frames = ws_manager.add(conn_id.clone()).await;
    let (progress_tx, mut progress_rx): (ProgressSink, _) = mpsc::unbounded_channel();

    let (mut sink, mut stream) = socket.split();

    let writer_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = frames.recv() => frame,
                Some(message) = progress_rx.recv() => match encode(&message) {
                    Some(frame) => frame,
                    None => continue,
                },
                else => break,
            };
            if sink.send(frame).await.is_err() {
                tracing::debug!(conn_id = %writer_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match parse_command(text.as_str()) {
                Some(ClientCommand::Subscribe(task_id)) => {
                    tracing::debug!(conn_id = %conn_id, task_id = %task_id, "Subscribe");
                    progress.subscribe(&task_id, progress_tx.clone());
                }
                Some(ClientCommand::Unsubscribe(task_id)) => {
                    tracing::debug!(conn_id = %conn_id, task_id = %task_id, "Unsubscribe");
                    progress.unsubscribe(&task_id);
                }
                Some(ClientCommand::Ping) => {
                    let pong = serde_json::json!({ "type": MSG_TYPE_PONG }).to_string();
                    ws_manager.send(&conn_id, Message::Text(pong.into())).await;
                }
                None => {
                    tracing::debug!(conn_id = %conn_id, "Ignoring unrecognised client message");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    progress.detach_sink(&progress_tx);
    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}
