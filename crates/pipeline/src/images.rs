//! References to generated images as returned to callers and stored on
//! the task row.

use serde::{Deserialize, Serialize};

/// Where an image reference points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSource {
    /// Copied from the engine into temporary storage.
    Engine,
    /// Placeholder produced without the engine.
    Mock,
    /// The copy failed; the URL is the engine-hosted original.
    FallbackCopy,
}

impl ImageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSource::Engine => "engine",
            ImageSource::Mock => "mock",
            ImageSource::FallbackCopy => "fallback-copy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImageRef {
    pub id: String,
    pub url: String,
    pub seed: i64,
    pub file_size: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub source: ImageSource,
    /// Engine-side file name, when the image came from the engine.
    pub filename: Option<String>,
}
