use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when a dependency is down.
    pub status: &'static str,
    pub version: &'static str,
    pub db_healthy: bool,
    pub engine_healthy: bool,
}

/// GET /health -- service, database and engine health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (db, engine_healthy) = tokio::join!(
        atelier_db::health_check(&state.pool),
        state.engine.check_health(),
    );
    let db_healthy = db.is_ok();

    let status = if db_healthy && engine_healthy {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        engine_healthy,
    })
}

/// Mount health check routes (root level, not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
