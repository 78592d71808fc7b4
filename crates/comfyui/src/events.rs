//! Normalized events emitted by the ComfyUI listener.
//!
//! These are what the progress router consumes. Raw WebSocket messages
//! that carry nothing a waiting client cares about (queue status, cached
//! node lists, per-node outputs) never become events.

/// A platform-level event originating from the ComfyUI event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The WebSocket connection was established.
    Connected,

    /// The WebSocket connection was lost.
    Disconnected,

    /// A prompt started executing.
    ExecutionStarted { prompt_id: String },

    /// A node of a prompt began executing.
    NodeExecuting {
        prompt_id: Option<String>,
        node: String,
    },

    /// Step progress inside the executing node.
    Progress {
        prompt_id: Option<String>,
        node: Option<String>,
        value: i32,
        max: i32,
    },

    /// All nodes of a prompt finished.
    Completed { prompt_id: Option<String> },

    /// A prompt failed.
    Failed {
        prompt_id: String,
        node_id: Option<String>,
        message: String,
    },
}

impl EngineEvent {
    /// Explicit prompt id carried by the event, if any.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ExecutionStarted { prompt_id } | EngineEvent::Failed { prompt_id, .. } => {
                Some(prompt_id)
            }
            EngineEvent::NodeExecuting { prompt_id, .. }
            | EngineEvent::Progress { prompt_id, .. }
            | EngineEvent::Completed { prompt_id } => prompt_id.as_deref(),
            EngineEvent::Connected | EngineEvent::Disconnected => None,
        }
    }
}

/// Completion percentage (0-100) for a step counter.
pub fn percent(value: i32, max: i32) -> i16 {
    if max <= 0 {
        return 0;
    }
    let pct = (f64::from(value) / f64::from(max) * 100.0).round();
    pct.clamp(0.0, 100.0) as i16
}
