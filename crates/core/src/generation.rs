//! Generation request rules: limits, defaults, pricing, size parsing,
//! duration estimation and seed resolution.

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::Credits;

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Credits charged per generated image.
pub const GENERATION_COST_PER_IMAGE: Credits = 15;

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

pub const MIN_BATCH_SIZE: i32 = 1;
pub const MAX_BATCH_SIZE: i32 = 4;
pub const MIN_CFG_SCALE: f64 = 1.0;
pub const MAX_CFG_SCALE: f64 = 20.0;
pub const MIN_STEPS: i32 = 10;
pub const MAX_STEPS: i32 = 50;
pub const MAX_PROMPT_LEN: usize = 2000;
/// Smallest and largest accepted edge length in pixels.
pub const MIN_IMAGE_EDGE: u32 = 64;
pub const MAX_IMAGE_EDGE: u32 = 2048;
pub const MAX_TASK_ID_LEN: usize = 64;

pub const DEFAULT_SIZE: &str = "1024x1024";
pub const DEFAULT_BATCH_SIZE: i32 = 1;
pub const DEFAULT_CFG_SCALE: f64 = 7.5;
pub const DEFAULT_STEPS: i32 = 25;
pub const DEFAULT_CLIP_SKIP: i32 = 2;
/// A negative seed asks the service to pick one.
pub const RANDOM_SEED: i64 = -1;
/// Upper bound (exclusive) for service-chosen seeds.
pub const MAX_RANDOM_SEED: i64 = 2_147_483_647;
/// Largest seed a caller may pick; browsers cannot represent more.
pub const MAX_SEED: i64 = 9_007_199_254_740_991;

/// img2img denoise strength.
pub const DEFAULT_DENOISE_STRENGTH: f64 = 0.75;
pub const DEFAULT_UPSCALE_MODEL: &str = "RealESRGAN_x4plus.pth";
pub const UPSCALE_FACTOR: u32 = 2;

/// Hard ceiling on waiting for the engine once a job is submitted.
pub const GENERATION_TIMEOUT_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Workflow kinds
// ---------------------------------------------------------------------------

/// Which workflow template a request renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    #[default]
    Text2img,
    Img2img,
    Upscale,
}

impl WorkflowKind {
    /// File name of the template backing this workflow.
    pub fn template_name(self) -> &'static str {
        match self {
            WorkflowKind::Text2img => "text2img_basic.json",
            WorkflowKind::Img2img => "img2img_basic.json",
            WorkflowKind::Upscale => "upscale_basic.json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Text2img => "text2img",
            WorkflowKind::Img2img => "img2img",
            WorkflowKind::Upscale => "upscale",
        }
    }

    /// img2img and upscale start from an existing engine-side image.
    pub fn needs_input_image(self) -> bool {
        !matches!(self, WorkflowKind::Text2img)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

fn default_size() -> String {
    DEFAULT_SIZE.to_string()
}

fn default_batch_size() -> i32 {
    DEFAULT_BATCH_SIZE
}

fn default_cfg_scale() -> f64 {
    DEFAULT_CFG_SCALE
}

fn default_steps() -> i32 {
    DEFAULT_STEPS
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

fn default_clip_skip() -> i32 {
    DEFAULT_CLIP_SKIP
}

/// A user's generation request as accepted over HTTP.
///
/// `model` and `sampler` have no defaults: the caller picks them from the
/// engine's introspection lists.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 2000, message = "prompt must be 1-2000 characters"))]
    pub prompt: String,
    #[serde(default)]
    #[validate(length(max = 2000, message = "negativePrompt must be at most 2000 characters"))]
    pub negative_prompt: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "model is required"))]
    pub model: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "sampler is required"))]
    pub sampler: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 4, message = "batchSize must be between 1 and 4"))]
    pub batch_size: i32,
    #[serde(default = "default_cfg_scale")]
    #[validate(range(min = 1.0, max = 20.0, message = "cfgScale must be between 1 and 20"))]
    pub cfg_scale: f64,
    #[serde(default = "default_steps")]
    #[validate(range(min = 10, max = 50, message = "steps must be between 10 and 50"))]
    pub steps: i32,
    #[serde(default = "default_seed")]
    #[validate(range(min = -1, message = "seed must be -1 or non-negative"))]
    pub seed: i64,
    #[serde(default = "default_clip_skip")]
    #[validate(range(min = 1, max = 12, message = "clipSkip must be between 1 and 12"))]
    pub clip_skip: i32,
    #[serde(default, rename = "type")]
    pub workflow: WorkflowKind,
    /// Engine-side file name of the source image for img2img and upscale.
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "inputImage must be 1-255 characters"))]
    pub input_image: Option<String>,
    /// Caller-chosen task id so a client can subscribe to progress before
    /// the request returns.
    #[serde(default, rename = "frontendTaskId", alias = "taskId")]
    pub task_id: Option<String>,
}

/// A validated request with its size parsed and seed resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedGeneration {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub sampler: String,
    pub size: ImageSize,
    pub batch_size: i32,
    pub cfg_scale: f64,
    pub steps: i32,
    pub seed: i64,
    pub clip_skip: i32,
    pub workflow: WorkflowKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_image: Option<String>,
}

impl ResolvedGeneration {
    pub fn total_cost(&self) -> Credits {
        total_cost(self.batch_size)
    }

    pub fn estimated_secs(&self) -> i32 {
        estimate_duration_secs(self.size, self.batch_size, self.steps)
    }

    /// Seed reported for the `index`-th image of the batch.
    pub fn image_seed(&self, index: usize) -> i64 {
        self.seed.saturating_add(i64::try_from(index).unwrap_or(i64::MAX))
    }
}

/// Validate a request and resolve its derived values.
///
/// Pure: fails before any ledger or engine interaction.
pub fn resolve_request(request: &GenerationRequest) -> Result<ResolvedGeneration, CoreError> {
    request
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;

    if request.prompt.trim().is_empty() {
        return Err(CoreError::Validation("prompt must not be blank".into()));
    }
    if request.prompt.chars().count() > MAX_PROMPT_LEN {
        return Err(CoreError::Validation(format!(
            "prompt must be at most {MAX_PROMPT_LEN} characters"
        )));
    }
    if request.seed > MAX_SEED {
        return Err(CoreError::Validation(format!(
            "seed must be at most {MAX_SEED}"
        )));
    }
    if !request.cfg_scale.is_finite() {
        return Err(CoreError::Validation("cfgScale must be a finite number".into()));
    }
    if let Some(task_id) = &request.task_id {
        validate_task_id(task_id)?;
    }
    if request.workflow.needs_input_image() && request.input_image.is_none() {
        return Err(CoreError::Validation(format!(
            "inputImage is required for {} workflows",
            request.workflow.as_str()
        )));
    }

    let size = ImageSize::parse(&request.size)?;

    Ok(ResolvedGeneration {
        prompt: request.prompt.trim().to_string(),
        negative_prompt: request.negative_prompt.trim().to_string(),
        model: request.model.clone(),
        sampler: request.sampler.clone(),
        size,
        batch_size: request.batch_size,
        cfg_scale: request.cfg_scale,
        steps: request.steps,
        seed: resolve_seed(request.seed),
        clip_skip: request.clip_skip,
        workflow: request.workflow,
        input_image: request.input_image.clone(),
    })
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// Output dimensions parsed from a `"<width>x<height>"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = || {
            CoreError::Validation(format!(
                "Invalid size '{raw}'. Expected <width>x<height>, e.g. {DEFAULT_SIZE}"
            ))
        };
        let (w, h) = raw.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;

        for edge in [width, height] {
            if !(MIN_IMAGE_EDGE..=MAX_IMAGE_EDGE).contains(&edge) {
                return Err(CoreError::Validation(format!(
                    "Image edges must be between {MIN_IMAGE_EDGE} and {MAX_IMAGE_EDGE} pixels"
                )));
            }
        }
        Ok(Self { width, height })
    }

    pub fn is_square_1024(self) -> bool {
        self.width == 1024 && self.height == 1024
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Pricing and estimation
// ---------------------------------------------------------------------------

/// Total credits for a batch.
pub fn total_cost(batch_size: i32) -> Credits {
    GENERATION_COST_PER_IMAGE * Credits::from(batch_size.max(0))
}

/// Rough wall-clock estimate in seconds, never below 5.
///
/// Base 15s, +10s at 1024x1024, +12s per extra image, +2s per 5 steps
/// above 20.
pub fn estimate_duration_secs(size: ImageSize, batch_size: i32, steps: i32) -> i32 {
    let mut secs = 15;
    if size.is_square_1024() {
        secs += 10;
    }
    secs += (batch_size - 1) * 12;
    secs += ((steps - 20) as f64 / 5.0).floor() as i32 * 2;
    secs.max(5)
}

// ---------------------------------------------------------------------------
// Seeds and task ids
// ---------------------------------------------------------------------------

/// Keep a caller seed, or pick one when it is negative.
pub fn resolve_seed(seed: i64) -> i64 {
    if seed < 0 {
        rand::rng().random_range(0..MAX_RANDOM_SEED)
    } else {
        seed
    }
}

/// Generate a task id for requests that did not bring their own.
pub fn generate_task_id() -> String {
    format!("task_{}", uuid::Uuid::now_v7().simple())
}

/// Task ids travel through URLs and WebSocket messages: ASCII
/// alphanumerics, `-` and `_` only.
pub fn validate_task_id(task_id: &str) -> Result<(), CoreError> {
    if task_id.is_empty() || task_id.len() > MAX_TASK_ID_LEN {
        return Err(CoreError::Validation(format!(
            "taskId must be 1-{MAX_TASK_ID_LEN} characters"
        )));
    }
    if !task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(
            "taskId may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request() -> GenerationRequest {
        serde_json::from_value(serde_json::json!({
            "prompt": "a lighthouse at dusk",
            "model": "sdxl.safetensors",
            "sampler": "euler",
        }))
        .unwrap()
    }

    // -- defaults ------------------------------------------------------------

    #[test]
    fn missing_fields_take_defaults() {
        let req = request();
        assert_eq!(req.size, "1024x1024");
        assert_eq!(req.batch_size, 1);
        assert_eq!(req.cfg_scale, 7.5);
        assert_eq!(req.steps, 25);
        assert_eq!(req.seed, -1);
        assert_eq!(req.clip_skip, 2);
        assert_eq!(req.workflow, WorkflowKind::Text2img);
        assert!(req.task_id.is_none());
    }

    #[test]
    fn frontend_task_id_is_accepted() {
        let req: GenerationRequest = serde_json::from_value(serde_json::json!({
            "prompt": "p", "model": "m", "sampler": "s", "frontendTaskId": "task_1"
        }))
        .unwrap();
        assert_eq!(req.task_id.as_deref(), Some("task_1"));
    }

    // -- validation ----------------------------------------------------------

    #[test]
    fn valid_request_resolves() {
        let mut req = request();
        req.seed = 42;
        let resolved = resolve_request(&req).unwrap();
        assert_eq!(resolved.size, ImageSize { width: 1024, height: 1024 });
        assert_eq!(resolved.seed, 42);
        assert_eq!(resolved.total_cost(), 15);
    }

    #[test]
    fn random_seed_is_resolved_to_non_negative() {
        let resolved = resolve_request(&request()).unwrap();
        assert!(resolved.seed >= 0 && resolved.seed < MAX_RANDOM_SEED);
    }

    #[test]
    fn blank_prompt_rejected() {
        let mut req = request();
        req.prompt = "   ".into();
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn missing_model_rejected() {
        let mut req = request();
        req.model.clear();
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn missing_sampler_rejected() {
        let mut req = request();
        req.sampler.clear();
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn batch_size_out_of_range_rejected() {
        for batch in [0, 5] {
            let mut req = request();
            req.batch_size = batch;
            assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));
        }
    }

    #[test]
    fn cfg_and_steps_out_of_range_rejected() {
        let mut req = request();
        req.cfg_scale = 20.5;
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));

        let mut req = request();
        req.steps = 9;
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn seed_above_ceiling_rejected() {
        let mut req = request();
        req.seed = i64::MAX;
        req.batch_size = 2;
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(msg)) if msg.contains("seed"));

        let mut req = request();
        req.seed = MAX_SEED;
        req.batch_size = 4;
        let generation = resolve_request(&req).unwrap();
        assert_eq!(generation.image_seed(3), MAX_SEED + 3);
    }

    #[test]
    fn image_seed_saturates() {
        let mut generation = resolve_request(&request()).unwrap();
        generation.seed = i64::MAX - 1;
        assert_eq!(generation.image_seed(0), i64::MAX - 1);
        assert_eq!(generation.image_seed(3), i64::MAX);
    }

    #[test]
    fn bad_task_id_rejected() {
        let mut req = request();
        req.task_id = Some("../etc".into());
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn img2img_requires_input_image() {
        let mut req = request();
        req.workflow = WorkflowKind::Img2img;
        assert_matches!(resolve_request(&req), Err(CoreError::Validation(_)));

        req.input_image = Some("source.png".into());
        let resolved = resolve_request(&req).unwrap();
        assert_eq!(resolved.input_image.as_deref(), Some("source.png"));
    }

    // -- size ----------------------------------------------------------------

    #[test]
    fn size_parses_width_and_height() {
        assert_eq!(
            ImageSize::parse("768x512").unwrap(),
            ImageSize { width: 768, height: 512 }
        );
    }

    #[test]
    fn size_rejects_garbage_and_out_of_range() {
        assert!(ImageSize::parse("big").is_err());
        assert!(ImageSize::parse("1024").is_err());
        assert!(ImageSize::parse("32x32").is_err());
        assert!(ImageSize::parse("4096x1024").is_err());
    }

    // -- pricing / estimation ------------------------------------------------

    #[test]
    fn total_cost_is_per_image() {
        assert_eq!(total_cost(1), 15);
        assert_eq!(total_cost(2), 30);
        assert_eq!(total_cost(4), 60);
    }

    #[test]
    fn estimate_matches_formula() {
        let square = ImageSize { width: 1024, height: 1024 };
        let small = ImageSize { width: 512, height: 512 };
        assert_eq!(estimate_duration_secs(square, 1, 25), 27);
        assert_eq!(estimate_duration_secs(small, 2, 20), 27);
        assert_eq!(estimate_duration_secs(small, 1, 10), 11);
    }

    #[test]
    fn generated_task_ids_are_valid_and_unique() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_ne!(a, b);
        assert!(validate_task_id(&a).is_ok());
        assert!(a.starts_with("task_"));
    }

    #[test]
    fn workflow_kind_maps_to_template() {
        assert_eq!(WorkflowKind::Text2img.template_name(), "text2img_basic.json");
        assert_eq!(WorkflowKind::Upscale.template_name(), "upscale_basic.json");
    }
}
