//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps health checks, workflow submission, history retrieval and node
//! introspection using [`reqwest`]. Network-level failures are kept apart
//! from malformed or rejected responses because callers fall back
//! differently on each.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read endpoints tried in order by [`ComfyUIApi::check_health`].
pub const HEALTH_ENDPOINTS: [&str; 3] = ["/system_stats", "/queue", "/history"];

/// Per-endpoint timeout for health checks.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for `POST /prompt`.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for history and introspection reads.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    client_id: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i32,
}

/// One output image listed in a prompt's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub image_type: String,
    /// Retrieval URL on the engine's `/view` endpoint.
    #[serde(default)]
    pub url: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Connection refused, DNS failure, timeout or a dropped connection.
    #[error("ComfyUI unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    /// The request could not be built (bad base URL, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx response that does not have the expected shape.
    #[error("Malformed ComfyUI response: {body}")]
    Malformed {
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApiError {
    /// Whether the engine could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ComfyUIApiError::Unreachable(_))
    }

    fn from_send(err: reqwest::Error) -> Self {
        if err.is_builder() {
            ComfyUIApiError::Request(err)
        } else {
            ComfyUIApiError::Unreachable(err)
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url`   - Base HTTP URL, e.g. `http://host:8188`.
    /// * `client_id` - Identity sent with every submission; must match the
    ///   `clientId` of the WebSocket listener so events come back to us.
    pub fn new(api_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, client_id)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Try the known read endpoints in order.
    ///
    /// Returns `true` on the first 2xx response and `false` once every
    /// endpoint has failed or timed out. Never errors.
    pub async fn check_health(&self) -> bool {
        for endpoint in HEALTH_ENDPOINTS {
            let result = self
                .client
                .get(format!("{}{endpoint}", self.api_url))
                .timeout(HEALTH_CHECK_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(endpoint, "ComfyUI health endpoint answered");
                    return true;
                }
                Ok(response) => {
                    tracing::debug!(endpoint, status = response.status().as_u16(), "ComfyUI health endpoint failed");
                }
                Err(e) => {
                    tracing::debug!(endpoint, error = %e, "ComfyUI health endpoint failed");
                }
            }
        }
        tracing::warn!(api_url = %self.api_url, "ComfyUI health check failed on every endpoint");
        false
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow and this client's id. A
    /// non-2xx status is [`ComfyUIApiError::ApiError`]; a 2xx body without
    /// a `prompt_id` is [`ComfyUIApiError::Malformed`]. Both keep the raw
    /// body.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(ComfyUIApiError::from_send)?;

        let text = Self::success_text(response).await?;
        match serde_json::from_str::<SubmitResponse>(&text) {
            Ok(parsed) if !parsed.prompt_id.is_empty() => Ok(parsed),
            _ => Err(ComfyUIApiError::Malformed { body: text }),
        }
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON is
    /// keyed by prompt id and is `{}` while the prompt is still queued.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        self.get_json(&format!("/history/{prompt_id}")).await
    }

    /// Output images for a finished prompt.
    ///
    /// An empty list means the prompt is not in history yet (or produced
    /// nothing); that is a normal transient state, not an error.
    pub async fn fetch_images(&self, prompt_id: &str) -> Result<Vec<ImageDescriptor>, ComfyUIApiError> {
        let history = self.get_history(prompt_id).await?;
        Ok(self.extract_images(&history, prompt_id))
    }

    /// Pull `{filename, subfolder, type}` entries out of a history
    /// document and attach their `/view` URLs.
    pub fn extract_images(&self, history: &serde_json::Value, prompt_id: &str) -> Vec<ImageDescriptor> {
        let Some(outputs) = history
            .get(prompt_id)
            .and_then(|entry| entry.get("outputs"))
            .and_then(|outputs| outputs.as_object())
        else {
            return Vec::new();
        };

        outputs
            .values()
            .filter_map(|node| node.get("images").and_then(|images| images.as_array()))
            .flatten()
            .filter_map(|image| serde_json::from_value::<ImageDescriptor>(image.clone()).ok())
            .map(|mut image| {
                image.url = self.view_url(&image.filename, &image.subfolder, &image.image_type);
                image
            })
            .collect()
    }

    /// Build the `/view` URL for an output file, query-encoded.
    pub fn view_url(&self, filename: &str, subfolder: &str, image_type: &str) -> String {
        match reqwest::Url::parse(&format!("{}/view", self.api_url)) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair("filename", filename)
                    .append_pair("subfolder", subfolder)
                    .append_pair("type", image_type);
                url.to_string()
            }
            Err(_) => format!(
                "{}/view?filename={filename}&subfolder={subfolder}&type={image_type}",
                self.api_url
            ),
        }
    }

    /// Checkpoint names from `CheckpointLoaderSimple`.
    pub async fn list_models(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let info = self.get_json("/object_info").await?;
        Ok(choice_list(&info, "CheckpointLoaderSimple", "ckpt_name"))
    }

    /// Sampler names from `KSampler`.
    pub async fn list_samplers(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let info = self.get_json("/object_info").await?;
        Ok(choice_list(&info, "KSampler", "sampler_name"))
    }

    // ---- private helpers ----

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}{path}", self.api_url))
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(ComfyUIApiError::from_send)?;

        let text = Self::success_text(response).await?;
        serde_json::from_str(&text).map_err(|_| ComfyUIApiError::Malformed { body: text })
    }

    /// Ensure the response has a success status code and return its body.
    /// On failure the status and body text are kept for diagnostics.
    async fn success_text(response: reqwest::Response) -> Result<String, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        response.text().await.map_err(ComfyUIApiError::from_send)
    }
}

/// Read `info[node].input.required[field][0]` as a list of strings.
fn choice_list(info: &serde_json::Value, node: &str, field: &str) -> Vec<String> {
    info.get(node)
        .and_then(|n| n.pointer(&format!("/input/required/{field}/0")))
        .and_then(|choices| choices.as_array())
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
