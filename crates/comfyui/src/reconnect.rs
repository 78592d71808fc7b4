//! Exponential-backoff reconnection logic for the ComfyUI WebSocket.
//!
//! When the connection drops, the listener calls [`reconnect_loop`] to
//! keep retrying with increasing delays until either the connection is
//! restored or the [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Reconnect with exponential backoff.
///
/// Waits before each attempt. Returns `Some(connection)` once a connection
/// succeeds, or `None` if `cancel` fires first.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(ws_url = %client.ws_url(), "Reconnect cancelled");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            ws_url = %client.ws_url(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect() => match result {
                Ok(conn) => {
                    tracing::info!(ws_url = %client.ws_url(), attempt, "Reconnected to ComfyUI");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt {attempt} failed");
                }
            }
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = ComfyUIClient::new("ws://127.0.0.1:9", "c1");
        let config = ReconnectConfig::default();

        let result = reconnect_loop(&client, &config, &cancel).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_reconnect() {
        let cancel = CancellationToken::new();
        let client = ComfyUIClient::new("ws://127.0.0.1:9", "c1");
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            reconnect_loop(&client, &config, &cancel),
        )
        .await
        .expect("reconnect loop should stop once cancelled");
        assert!(result.is_none());
    }
}
