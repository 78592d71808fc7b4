//! Port between the orchestrator and the image generation engine.
//!
//! The orchestrator only sees [`GenerationEngine`]; production wires in
//! [`ComfyUIApi`], tests wire in scripted fakes.

use async_trait::async_trait;
use atelier_comfyui::api::{ComfyUIApi, ComfyUIApiError, ImageDescriptor};
use serde_json::Value;

/// Checkpoint list served when the engine cannot be asked.
pub const FALLBACK_MODELS: [&str; 1] = ["default.safetensors"];

/// Sampler list served when the engine cannot be asked.
pub const FALLBACK_SAMPLERS: [&str; 14] = [
    "euler",
    "euler_a",
    "heun",
    "dpm_2",
    "dpm_2_a",
    "lms",
    "dpm_fast",
    "dpm_adaptive",
    "dpmpp_2s_a",
    "dpmpp_sde",
    "dpmpp_2m",
    "ddim",
    "uni_pc",
    "uni_pc_bh2",
];

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Network-level failure: refused, DNS, timeout.
    #[error("Engine unreachable: {0}")]
    Unreachable(String),

    /// The engine answered but did not accept the job. Carries the raw
    /// response payload.
    #[error("Engine rejected the job: {0}")]
    Submit(String),

    /// A read-only query (history, introspection) failed.
    #[error("Engine query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Whether the engine answers at all. Never errors.
    async fn check_health(&self) -> bool;

    /// Queue a rendered job; returns the engine's job id.
    async fn submit(&self, job: &Value) -> Result<String, EngineError>;

    /// Output images of a finished job. Empty while the engine has no
    /// record of outputs.
    async fn fetch_result(&self, job_id: &str) -> Result<Vec<ImageDescriptor>, EngineError>;

    async fn list_models(&self) -> Result<Vec<String>, EngineError>;

    async fn list_samplers(&self) -> Result<Vec<String>, EngineError>;
}

impl From<ComfyUIApiError> for EngineError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Unreachable(_) => EngineError::Unreachable(err.to_string()),
            ComfyUIApiError::ApiError { body, .. } | ComfyUIApiError::Malformed { body } => {
                EngineError::Submit(body)
            }
            ComfyUIApiError::Request(_) => EngineError::Query(err.to_string()),
        }
    }
}

#[async_trait]
impl GenerationEngine for ComfyUIApi {
    async fn check_health(&self) -> bool {
        ComfyUIApi::check_health(self).await
    }

    async fn submit(&self, job: &Value) -> Result<String, EngineError> {
        let response = self.submit_workflow(job).await?;
        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Job queued on ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<ImageDescriptor>, EngineError> {
        self.fetch_images(job_id)
            .await
            .map_err(|e| EngineError::Query(e.to_string()))
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        ComfyUIApi::list_models(self)
            .await
            .map_err(|e| EngineError::Query(e.to_string()))
    }

    async fn list_samplers(&self) -> Result<Vec<String>, EngineError> {
        ComfyUIApi::list_samplers(self)
            .await
            .map_err(|e| EngineError::Query(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn rejection_keeps_raw_payload() {
        let err: EngineError = ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error":"bad node"}"#.into(),
        }
        .into();
        assert_matches!(err, EngineError::Submit(ref body) if body.contains("bad node"));
    }

    #[test]
    fn missing_prompt_id_is_a_submit_error() {
        let err: EngineError = ComfyUIApiError::Malformed { body: "{}".into() }.into();
        assert_matches!(err, EngineError::Submit(_));
    }

    #[test]
    fn fallback_lists_are_non_empty() {
        assert!(FALLBACK_SAMPLERS.contains(&"euler"));
        assert_eq!(FALLBACK_MODELS, ["default.safetensors"]);
    }
}
