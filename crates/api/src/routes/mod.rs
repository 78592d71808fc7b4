pub mod credits;
pub mod generation;
pub mod health;
pub mod models;

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                             WebSocket (progress subscriptions)
///
/// /generate                       submit a generation (POST)
/// /generate/{task_id}             task status (GET)
///
/// /models                         checkpoint names
/// /models/samplers                sampler names
///
/// /credits                        balance
/// /credits/stats                  earned / spent / net
/// /credits/transactions           paginated history
/// ```
///
/// Everything except `/ws` and `POST /generate` runs under
/// `request_timeout`; a generation waits on the engine for up to its own
/// ceiling.
pub fn api_routes(request_timeout: Duration) -> Router<AppState> {
    let timed = Router::new()
        .merge(generation::status_router())
        .nest("/models", models::router())
        .nest("/credits", credits::router())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(generation::submit_router())
        .merge(timed)
}
