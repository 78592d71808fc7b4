//! Workflow template engine.
//!
//! Templates are ComfyUI API-format job documents whose parameter slots
//! are leaf strings of the form `"PLACEHOLDER_<NAME>"`. Rendering walks the
//! parsed document and swaps each slot for a typed JSON value, so strings
//! stay strings (escaped by the serializer) and numbers stay numbers.
//!
//! Templates are loaded once at startup and shared read-only behind an
//! `Arc`; rendering never mutates them.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use atelier_core::generation::{
    ResolvedGeneration, DEFAULT_DENOISE_STRENGTH, DEFAULT_UPSCALE_MODEL, UPSCALE_FACTOR,
};
use serde_json::{Map, Number, Value};

/// Prefix marking a parameter slot inside a template.
pub const PLACEHOLDER_PREFIX: &str = "PLACEHOLDER_";

/// A parameter value with the JSON type it renders as.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl TemplateValue {
    fn to_json(&self, name: &str) -> Result<Value, RenderError> {
        Ok(match self {
            TemplateValue::String(s) => Value::String(s.clone()),
            TemplateValue::Integer(i) => Value::Number((*i).into()),
            TemplateValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| RenderError::NonFinite {
                    name: name.to_string(),
                })?,
            TemplateValue::Boolean(b) => Value::Bool(*b),
        })
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::String(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::String(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Integer(value)
    }
}

impl From<i32> for TemplateValue {
    fn from(value: i32) -> Self {
        TemplateValue::Integer(value.into())
    }
}

impl From<u32> for TemplateValue {
    fn from(value: u32) -> Self {
        TemplateValue::Integer(value.into())
    }
}

impl From<f64> for TemplateValue {
    fn from(value: f64) -> Self {
        TemplateValue::Float(value)
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        TemplateValue::Boolean(value)
    }
}

/// Named parameters fed to [`TemplateEngine::render`].
pub type ParamMap = HashMap<String, TemplateValue>;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Unknown workflow template '{0}'")]
    UnknownTemplate(String),

    #[error("Unresolved placeholders in '{template}': {}", missing.join(", "))]
    Unresolved {
        template: String,
        missing: Vec<String>,
    },

    #[error("Parameter {name} is not a finite number")]
    NonFinite { name: String },

    #[error("Template '{template}' is not a well-formed job: {reason}")]
    Malformed { template: String, reason: String },

    #[error("Failed to load template {path}: {reason}")]
    Load { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// A parsed job document with parameter slots.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    name: String,
    document: Value,
}

impl WorkflowTemplate {
    /// Parse and structurally check a template.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, RenderError> {
        let name = name.into();
        let document: Value = serde_json::from_str(text).map_err(|e| RenderError::Malformed {
            template: name.clone(),
            reason: e.to_string(),
        })?;
        check_job_shape(&name, &document)?;
        Ok(Self { name, document })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every placeholder name the template references.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_placeholders(&self.document, &mut names);
        names
    }
}

/// A job is an object of nodes, each with a string `class_type` and an
/// object `inputs`.
fn check_job_shape(template: &str, document: &Value) -> Result<(), RenderError> {
    let malformed = |reason: String| RenderError::Malformed {
        template: template.to_string(),
        reason,
    };

    let nodes = document
        .as_object()
        .ok_or_else(|| malformed("top level must be an object of nodes".into()))?;
    if nodes.is_empty() {
        return Err(malformed("job has no nodes".into()));
    }
    for (id, node) in nodes {
        if !node.get("class_type").is_some_and(Value::is_string) {
            return Err(malformed(format!("node {id} has no string class_type")));
        }
        if !node.get("inputs").is_some_and(Value::is_object) {
            return Err(malformed(format!("node {id} has no inputs object")));
        }
    }
    Ok(())
}

fn placeholder_name(s: &str) -> Option<&str> {
    let name = s.strip_prefix(PLACEHOLDER_PREFIX)?;
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    valid.then_some(name)
}

fn collect_placeholders(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(name) = placeholder_name(s) {
                names.insert(name.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, names)),
        _ => {}
    }
}

/// Substitute slots in a copy of `value`.
///
/// Strings that merely contain the prefix can never be substituted, so
/// they are reported as unresolved rather than passed through.
fn substitute(
    value: &Value,
    params: &ParamMap,
    missing: &mut BTreeSet<String>,
) -> Result<Value, RenderError> {
    match value {
        Value::String(s) => match placeholder_name(s) {
            Some(name) => match params.get(name) {
                Some(param) => param.to_json(name),
                None => {
                    missing.insert(name.to_string());
                    Ok(value.clone())
                }
            },
            None => {
                if s.contains(PLACEHOLDER_PREFIX) {
                    missing.insert(s.clone());
                }
                Ok(value.clone())
            }
        },
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, params, missing))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), substitute(v, params, missing)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(value.clone()),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Immutable set of named templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    templates: Arc<HashMap<String, WorkflowTemplate>>,
}

impl TemplateEngine {
    pub fn from_templates(templates: impl IntoIterator<Item = WorkflowTemplate>) -> Self {
        let templates = templates
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        Self {
            templates: Arc::new(templates),
        }
    }

    /// Load every `*.json` file in `dir`, keyed by file name.
    ///
    /// Called once at startup, so blocking filesystem access is fine.
    pub fn load_dir(dir: &Path) -> Result<Self, RenderError> {
        let load_err = |path: &Path, reason: String| RenderError::Load {
            path: path.display().to_string(),
            reason,
        };

        let entries = std::fs::read_dir(dir).map_err(|e| load_err(dir, e.to_string()))?;
        let mut templates = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| load_err(dir, e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path).map_err(|e| load_err(&path, e.to_string()))?;
            let template = WorkflowTemplate::parse(name, &text)?;
            tracing::debug!(
                template = %name,
                placeholders = template.placeholders().len(),
                "Loaded workflow template",
            );
            templates.push(template);
        }
        Ok(Self::from_templates(templates))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Template names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Render a template into a submittable job document.
    ///
    /// Either every slot is filled or nothing is returned. Parameters the
    /// template does not reference are ignored.
    pub fn render(&self, name: &str, params: &ParamMap) -> Result<Value, RenderError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| RenderError::UnknownTemplate(name.to_string()))?;

        let mut missing = BTreeSet::new();
        let job = substitute(&template.document, params, &mut missing)?;
        if !missing.is_empty() {
            return Err(RenderError::Unresolved {
                template: name.to_string(),
                missing: missing.into_iter().collect(),
            });
        }
        check_job_shape(name, &job)?;
        Ok(job)
    }
}

// ---------------------------------------------------------------------------
// Standard parameters
// ---------------------------------------------------------------------------

/// The parameter map every workflow kind renders from.
///
/// `CLIP_SKIP` is negated: the engine's `CLIPSetLastLayer` counts layers
/// back from the end.
pub fn build_generation_params(generation: &ResolvedGeneration) -> ParamMap {
    let size = generation.size;
    let mut params: ParamMap = [
        ("POSITIVE_PROMPT", TemplateValue::from(generation.prompt.as_str())),
        ("NEGATIVE_PROMPT", generation.negative_prompt.as_str().into()),
        ("MODEL_NAME", generation.model.as_str().into()),
        ("SAMPLER", generation.sampler.as_str().into()),
        ("WIDTH", size.width.into()),
        ("HEIGHT", size.height.into()),
        ("BATCH_SIZE", generation.batch_size.into()),
        ("CFG_SCALE", generation.cfg_scale.into()),
        ("STEPS", generation.steps.into()),
        ("SEED", generation.seed.into()),
        ("CLIP_SKIP", (-generation.clip_skip).into()),
        ("DENOISE_STRENGTH", DEFAULT_DENOISE_STRENGTH.into()),
        ("UPSCALE_WIDTH", (size.width * UPSCALE_FACTOR).into()),
        ("UPSCALE_HEIGHT", (size.height * UPSCALE_FACTOR).into()),
        ("UPSCALE_MODEL", DEFAULT_UPSCALE_MODEL.into()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    if let Some(input) = &generation.input_image {
        params.insert("INPUT_IMAGE".into(), input.as_str().into());
    }
    params
}

/// Human-readable label per node id: `_meta.title`, else `class_type`.
pub fn node_titles(job: &Value) -> HashMap<String, String> {
    let Some(nodes) = job.as_object() else {
        return HashMap::new();
    };
    nodes
        .iter()
        .filter_map(|(id, node)| {
            let title = node
                .pointer("/_meta/title")
                .and_then(Value::as_str)
                .or_else(|| node.get("class_type").and_then(Value::as_str))?;
            Some((id.clone(), title.to_string()))
        })
        .collect()
}
