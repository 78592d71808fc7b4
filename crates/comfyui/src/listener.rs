//! Long-lived listener on the ComfyUI event channel.
//!
//! [`spawn_listener`] runs the connect -> process -> reconnect loop in a
//! background task and hands back the receiving end of the normalized
//! [`EngineEvent`] stream.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::events::EngineEvent;
use crate::processor::process_messages;
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Start listening on a background task.
///
/// The task exits when `cancel` fires or when the returned receiver is
/// dropped.
pub fn spawn_listener(
    client: ComfyUIClient,
    config: ReconnectConfig,
    cancel: CancellationToken,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<EngineEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        tracing::info!(ws_url = %client.ws_url(), "Starting ComfyUI listener");
        run_connection_loop(&client, &config, &event_tx, &cancel).await;
        tracing::info!("ComfyUI listener exited");
    });
    (handle, event_rx)
}

/// Core connection loop: connect -> process messages -> reconnect.
///
/// Runs until the cancellation token is triggered or the receiver is gone.
pub async fn run_connection_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    event_tx: &mpsc::UnboundedSender<EngineEvent>,
    cancel: &CancellationToken,
) {
    let mut pending: Option<ComfyUIConnection> = None;

    loop {
        let conn = match pending.take() {
            Some(conn) => conn,
            None => match client.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
                    match reconnect_loop(client, config, cancel).await {
                        Some(conn) => conn,
                        None => return,
                    }
                }
            },
        };

        if event_tx.send(EngineEvent::Connected).is_err() {
            return;
        }

        let mut ws_stream = conn.ws_stream;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = process_messages(&mut ws_stream, event_tx) => {}
        }

        if event_tx.send(EngineEvent::Disconnected).is_err() || cancel.is_cancelled() {
            return;
        }

        tracing::info!("Connection lost, entering reconnect loop");
        match reconnect_loop(client, config, cancel).await {
            Some(conn) => pending = Some(conn),
            None => return,
        }
    }
}
