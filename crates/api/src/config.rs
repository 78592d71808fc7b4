use std::path::PathBuf;

use atelier_core::generation::GENERATION_TIMEOUT_SECS;

use crate::auth::jwt::JwtConfig;

/// Server configuration loaded from environment variables.
///
/// All fields except the JWT secret have defaults suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// Ceiling for ordinary requests. Generation requests are exempt and
    /// bounded by `generation_timeout_secs` instead.
    pub request_timeout_secs: u64,
    /// How long to wait for background tasks after the server stops.
    pub shutdown_timeout_secs: u64,
    pub jwt: JwtConfig,
    /// Base URL of the ComfyUI HTTP API.
    pub comfyui_url: String,
    /// Directory holding the workflow template files.
    pub workflows_dir: PathBuf,
    /// Where engine images are copied to.
    pub temp_upload_dir: PathBuf,
    /// URL prefix the temp directory is served under.
    pub temp_url_prefix: String,
    pub generation_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                  |
    /// |---------------------------|--------------------------|
    /// | `HOST`                    | `0.0.0.0`                |
    /// | `PORT`                    | `3000`                   |
    /// | `CORS_ORIGINS`            | `http://localhost:5173`  |
    /// | `REQUEST_TIMEOUT_SECS`    | `30`                     |
    /// | `SHUTDOWN_TIMEOUT_SECS`   | `30`                     |
    /// | `COMFYUI_URL`             | `http://127.0.0.1:8188`  |
    /// | `WORKFLOWS_DIR`           | `workflows`              |
    /// | `TEMP_UPLOAD_DIR`         | `uploads/temp`           |
    /// | `TEMP_URL_PREFIX`         | `/uploads/temp`          |
    /// | `GENERATION_TIMEOUT_SECS` | `600`                    |
    /// | `RECONCILE_INTERVAL_SECS` | `300`                    |
    ///
    /// # Panics
    ///
    /// Panics on unparseable numbers and when `JWT_SECRET` is missing;
    /// misconfiguration should stop the process at startup.
    pub fn from_env() -> Self {
        let host = env_or("HOST", "0.0.0.0");

        let port: u16 = env_or("PORT", "3000")
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = env_or("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECS", "30")
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = env_or("SHUTDOWN_TIMEOUT_SECS", "30")
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let generation_timeout_secs: u64 =
            env_or("GENERATION_TIMEOUT_SECS", &GENERATION_TIMEOUT_SECS.to_string())
                .parse()
                .expect("GENERATION_TIMEOUT_SECS must be a valid u64");

        let reconcile_interval_secs: u64 = env_or("RECONCILE_INTERVAL_SECS", "300")
            .parse()
            .expect("RECONCILE_INTERVAL_SECS must be a valid u64");
        assert!(reconcile_interval_secs > 0, "RECONCILE_INTERVAL_SECS must be positive");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            jwt: JwtConfig::from_env(),
            comfyui_url: env_or("COMFYUI_URL", "http://127.0.0.1:8188")
                .trim_end_matches('/')
                .to_string(),
            workflows_dir: env_or("WORKFLOWS_DIR", "workflows").into(),
            temp_upload_dir: env_or("TEMP_UPLOAD_DIR", "uploads/temp").into(),
            temp_url_prefix: env_or("TEMP_URL_PREFIX", "/uploads/temp"),
            generation_timeout_secs,
            reconcile_interval_secs,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
