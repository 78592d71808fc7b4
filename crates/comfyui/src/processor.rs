//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, normalizes them into
//! [`EngineEvent`]s and forwards those on an mpsc channel.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::events::EngineEvent;
use crate::messages::{parse_message, ComfyUIMessage};

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a receive error, the
/// stream is exhausted, or the event receiver is dropped. Unparseable
/// frames are logged and skipped.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages<S>(ws_stream: &mut S, event_tx: &mpsc::UnboundedSender<EngineEvent>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Some(event) = handle_text_message(&text) {
                    if event_tx.send(event).is_err() {
                        tracing::info!("Engine event receiver dropped, stopping processor");
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Parse one text frame and map it to an event, if it is one.
pub fn handle_text_message(text: &str) -> Option<EngineEvent> {
    match parse_message(text) {
        Ok(msg) => to_engine_event(msg),
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Ignoring unparseable ComfyUI message");
            None
        }
    }
}

/// Normalize a typed message.
pub fn to_engine_event(msg: ComfyUIMessage) -> Option<EngineEvent> {
    match msg {
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
            Some(EngineEvent::ExecutionStarted {
                prompt_id: data.prompt_id,
            })
        }
        ComfyUIMessage::Executing(data) => match data.node {
            Some(node) => Some(EngineEvent::NodeExecuting {
                prompt_id: data.prompt_id,
                node,
            }),
            None => {
                tracing::info!(prompt_id = ?data.prompt_id, "Execution completed (all nodes done)");
                Some(EngineEvent::Completed {
                    prompt_id: data.prompt_id,
                })
            }
        },
        ComfyUIMessage::Progress(data) => Some(EngineEvent::Progress {
            prompt_id: data.prompt_id,
            node: data.node,
            value: data.value,
            max: data.max,
        }),
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            let message = if data.exception_message.is_empty() {
                "ComfyUI execution failed".to_string()
            } else {
                data.exception_message
            };
            Some(EngineEvent::Failed {
                prompt_id: data.prompt_id,
                node_id: data.node_id,
                message,
            })
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, "Node executed with output");
            None
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
            None
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            None
        }
    }
}
