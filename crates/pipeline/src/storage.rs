//! Temporary storage for images copied off the engine.
//!
//! Engine-hosted URLs only live as long as the engine's output folder, so
//! finished images are downloaded into a local temp directory served under
//! a URL prefix (e.g. `/uploads/temp`).

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use atelier_comfyui::api::ImageDescriptor;

/// Per-image download ceiling.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A copied image and where it is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub url: String,
    pub filename: String,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Not a readable image: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save(&self, image: &ImageDescriptor) -> Result<StoredImage, StorageError>;
}

/// Downloads into a local directory.
#[derive(Debug, Clone)]
pub struct LocalTempStore {
    client: reqwest::Client,
    dir: PathBuf,
    url_prefix: String,
}

impl LocalTempStore {
    pub fn new(dir: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            dir: dir.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// `temp_<millis>_<uuid>.<ext>`, keeping the engine file's extension.
fn temp_file_name(source_name: &str) -> String {
    let ext = Path::new(source_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("png");
    format!(
        "temp_{}_{}.{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple(),
        ext.to_ascii_lowercase()
    )
}

/// Pixel dimensions from the image header.
fn dimensions(bytes: &[u8]) -> Result<(u32, u32), StorageError> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| StorageError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| StorageError::Decode(e.to_string()))
}

#[async_trait]
impl ImageStore for LocalTempStore {
    async fn save(&self, image: &ImageDescriptor) -> Result<StoredImage, StorageError> {
        let response = self
            .client
            .get(&image.url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StorageError::Download(format!(
                "{} returned {}",
                image.url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;

        let (width, height) = dimensions(&bytes)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let filename = temp_file_name(&image.filename);
        tokio::fs::write(self.dir.join(&filename), &bytes).await?;

        tracing::debug!(
            source = %image.filename,
            stored = %filename,
            bytes = bytes.len(),
            "Copied engine image to temp storage",
        );

        Ok(StoredImage {
            url: format!("{}/{}", self.url_prefix, filename),
            filename,
            file_size: bytes.len() as u64,
            width,
            height,
        })
    }
}
