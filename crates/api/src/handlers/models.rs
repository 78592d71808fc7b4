//! Engine introspection with fallback lists.
//!
//! When the engine cannot be queried the built-in defaults are served so
//! clients can still render their pickers; `source` tells them which.

use atelier_pipeline::engine::{FALLBACK_MODELS, FALLBACK_SAMPLERS};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct NameList {
    pub names: Vec<String>,
    /// `engine` or `fallback`.
    pub source: &'static str,
}

fn with_fallback(
    listed: Result<Vec<String>, atelier_pipeline::engine::EngineError>,
    fallback: &[&str],
    what: &str,
) -> NameList {
    match listed {
        Ok(names) if !names.is_empty() => NameList {
            names,
            source: "engine",
        },
        Ok(_) => {
            tracing::warn!(what, "Engine listed nothing, serving fallback");
            fallback_list(fallback)
        }
        Err(e) => {
            tracing::warn!(what, error = %e, "Engine introspection failed, serving fallback");
            fallback_list(fallback)
        }
    }
}

fn fallback_list(fallback: &[&str]) -> NameList {
    NameList {
        names: fallback.iter().map(|s| s.to_string()).collect(),
        source: "fallback",
    }
}

/// GET /api/v1/models
pub async fn list_models(
    State(state): State<AppState>,
    _user: AuthUser,
) -> AppResult<impl IntoResponse> {
    let listed = state.engine.list_models().await;
    Ok(Json(DataResponse {
        data: with_fallback(listed, &FALLBACK_MODELS, "models"),
    }))
}

/// GET /api/v1/models/samplers
pub async fn list_samplers(
    State(state): State<AppState>,
    _user: AuthUser,
) -> AppResult<impl IntoResponse> {
    let listed = state.engine.list_samplers().await;
    Ok(Json(DataResponse {
        data: with_fallback(listed, &FALLBACK_SAMPLERS, "samplers"),
    }))
}
