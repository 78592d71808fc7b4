//! Route definitions for the `/credits` resource.

use axum::routing::get;
use axum::Router;

use crate::handlers::credits;
use crate::state::AppState;

/// Routes mounted at `/credits`.
///
/// ```text
/// GET /               -> balance
/// GET /stats          -> stats
/// GET /transactions   -> transactions (?page&pageSize&type&startDate&endDate)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(credits::balance))
        .route("/stats", get(credits::stats))
        .route("/transactions", get(credits::transactions))
}
