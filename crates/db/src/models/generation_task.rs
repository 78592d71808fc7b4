//! Generation task rows.

use atelier_core::types::{Credits, DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::status::{StatusId, TaskStatus};

/// A row from the `generation_tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationTask {
    pub id: String,
    pub user_id: DbId,
    pub status_id: StatusId,
    pub workflow: String,
    pub parameters: serde_json::Value,
    pub cost: Credits,
    pub estimated_secs: i32,
    pub actual_secs: Option<i32>,
    pub prompt_id: Option<String>,
    pub image_source: Option<String>,
    pub images: Option<serde_json::Value>,
    pub credits_charged: bool,
    pub billing_error: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub submitted_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl GenerationTask {
    /// Typed status; `None` only if the lookup table drifted from the enum.
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::from_id(self.status_id)
    }
}

/// Insert payload for a freshly accepted task.
#[derive(Debug, Clone)]
pub struct NewGenerationTask {
    pub id: String,
    pub user_id: DbId,
    pub workflow: String,
    pub parameters: serde_json::Value,
    pub cost: Credits,
    pub estimated_secs: i32,
}
