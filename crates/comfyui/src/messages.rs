//! Frames the ComfyUI server pushes on `/ws`.
//!
//! Every text frame is `{"type": ..., "data": {...}}`. Fields that vary
//! between ComfyUI releases are optional; [`crate::processor`] decides
//! what each frame means for a running prompt.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    Status(StatusData),
    ExecutionStart(ExecutionStartData),
    /// Nodes whose outputs came from the engine's cache.
    ExecutionCached(ExecutionCachedData),
    /// `node: null` marks the end of a prompt.
    Executing(ExecutingData),
    /// Sampler step counter.
    Progress(ProgressData),
    Executed(ExecutedData),
    ExecutionError(ErrorData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Only sent on the first status frame of a session.
    #[serde(default)]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    /// Missing on older servers; the progress router falls back to the
    /// prompt that started last.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Decode one text frame. Unknown `type`s (custom-node telemetry and the
/// like) are errors the caller logs and skips.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
                assert_eq!(data.sid.as_deref(), Some("abc"));
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_cached_without_nodes() {
        let json = r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionCached(data) => {
                assert!(data.nodes.is_empty());
            }
            other => panic!("Expected ExecutionCached, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_finished() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executing(data) => {
                assert!(data.node.is_none());
                assert_eq!(data.prompt_id.as_deref(), Some("xyz"));
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_without_prompt_id() {
        let json = r#"{"type":"executing","data":{"node":"3"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executing(data) => {
                assert_eq!(data.node.as_deref(), Some("3"));
                assert!(data.prompt_id.is_none());
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_message() {
        let json = r#"{"type":"progress","data":{"value":5,"max":20,"prompt_id":"p","node":"3"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Progress(data) => {
                assert_eq!(data.value, 5);
                assert_eq!(data.max, 20);
                assert_eq!(data.node.as_deref(), Some("3"));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_with_partial_fields() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","exception_message":"out of memory"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionError(data) => {
                assert_eq!(data.prompt_id, "abc");
                assert!(data.node_id.is_none());
                assert_eq!(data.exception_message, "out of memory");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        let json = r#"{"type":"crystools.monitor","data":{}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
        assert!(parse_message(r#"{"type":"progress","data":{"value":"x"}}"#).is_err());
    }
}
