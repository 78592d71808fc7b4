//! Persistence port for generation tasks.
//!
//! Every status write is conditional on the expected prior status, so a
//! task reaches exactly one terminal status however the orchestrator and
//! cleanup paths interleave.

mod memory;
mod postgres;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;

use async_trait::async_trait;
use atelier_core::error::CoreError;
use atelier_db::models::generation_task::{GenerationTask, NewGenerationTask};
use atelier_db::models::status::TaskStatus;

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("Task {0} already exists")]
    Duplicate(String),

    #[error("Task store error: {0}")]
    Storage(String),
}

impl From<TaskStoreError> for CoreError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::Duplicate(id) => CoreError::Conflict(format!("Task {id} already exists")),
            TaskStoreError::Storage(msg) => CoreError::Internal(msg),
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `pending` task.
    async fn create(&self, task: NewGenerationTask) -> Result<GenerationTask, TaskStoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, TaskStoreError>;

    /// Move to a non-terminal status. `false` if the task was not in an
    /// allowed predecessor status.
    async fn advance(&self, task_id: &str, next: TaskStatus) -> Result<bool, TaskStoreError>;

    /// `rendering -> submitted`, recording the engine job id.
    async fn mark_submitted(&self, task_id: &str, prompt_id: &str)
        -> Result<bool, TaskStoreError>;

    /// Terminal success.
    async fn complete(
        &self,
        task_id: &str,
        image_source: &str,
        images: &serde_json::Value,
        actual_secs: i32,
    ) -> Result<bool, TaskStoreError>;

    /// Terminal failure; `status` is `Failed` or `TimedOut`.
    async fn fail(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: &str,
        actual_secs: i32,
    ) -> Result<bool, TaskStoreError>;

    async fn mark_charged(&self, task_id: &str) -> Result<(), TaskStoreError>;

    async fn record_billing_error(&self, task_id: &str, error: &str)
        -> Result<(), TaskStoreError>;

    /// Completed, not yet charged, and older than `grace_secs`.
    async fn list_unbilled(
        &self,
        grace_secs: i64,
        limit: i64,
    ) -> Result<Vec<GenerationTask>, TaskStoreError>;
}
