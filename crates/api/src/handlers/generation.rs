//! Handlers for generation requests.
//!
//! Routes:
//! - `POST /generate`            -- run a generation and return its images
//! - `GET  /generate/{task_id}`  -- stored task status (owner only)

use atelier_core::generation::{validate_task_id, GenerationRequest};
use atelier_core::types::{Credits, Timestamp};
use atelier_db::models::generation_task::GenerationTask;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/generate
///
/// Holds the request open until the engine finishes, the mock fallback
/// answers, or the generation ceiling passes. Clients that want progress
/// pass `frontendTaskId` and subscribe to it over `/api/v1/ws` first.
pub async fn generate(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<GenerationRequest>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.orchestrator.generate(user.user_id, &input).await?;

    if let Some(billing_error) = &outcome.billing_error {
        tracing::warn!(
            task_id = %outcome.task_id,
            user_id = user.user_id,
            error = %billing_error,
            "Returning generation result with pending debit",
        );
    }

    Ok(Json(DataResponse { data: outcome }))
}

/// Task status as exposed over HTTP.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: &'static str,
    pub workflow: String,
    pub cost: Credits,
    pub estimated_time: i32,
    pub actual_time: Option<i32>,
    pub image_source: Option<String>,
    pub images: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl From<GenerationTask> for TaskStatusResponse {
    fn from(task: GenerationTask) -> Self {
        Self {
            status: task.status().map_or("unknown", |s| s.name()),
            task_id: task.id,
            workflow: task.workflow,
            cost: task.cost,
            estimated_time: task.estimated_secs,
            actual_time: task.actual_secs,
            image_source: task.image_source,
            images: task.images,
            error: task.error_message,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

/// GET /api/v1/generate/{task_id}
pub async fn task_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(task_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    validate_task_id(&task_id)?;
    let task = state.orchestrator.task_status(user.user_id, &task_id).await?;
    Ok(Json(DataResponse {
        data: TaskStatusResponse::from(task),
    }))
}
