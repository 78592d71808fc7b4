//! Route definitions for the `/models` resource.

use axum::routing::get;
use axum::Router;

use crate::handlers::models;
use crate::state::AppState;

/// Routes mounted at `/models`.
///
/// ```text
/// GET /           -> list_models
/// GET /samplers   -> list_samplers
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(models::list_models))
        .route("/samplers", get(models::list_samplers))
}
