//! Route definitions for generation requests.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// ```text
/// POST /generate
/// ```
pub fn submit_router() -> Router<AppState> {
    Router::new().route("/generate", post(generation::generate))
}

/// ```text
/// GET /generate/{task_id}
/// ```
pub fn status_router() -> Router<AppState> {
    Router::new().route("/generate/{task_id}", get(generation::task_status))
}
