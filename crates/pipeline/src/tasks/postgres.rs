//! [`TaskStore`] over [`GenerationTaskRepo`].

use async_trait::async_trait;
use atelier_db::models::generation_task::{GenerationTask, NewGenerationTask};
use atelier_db::models::status::TaskStatus;
use atelier_db::repositories::GenerationTaskRepo;
use sqlx::PgPool;

use super::{TaskStore, TaskStoreError};

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(err: sqlx::Error) -> TaskStoreError {
    TaskStoreError::Storage(err.to_string())
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: NewGenerationTask) -> Result<GenerationTask, TaskStoreError> {
        GenerationTaskRepo::create(&self.pool, &task)
            .await
            .map_err(|e| {
                if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                    TaskStoreError::Duplicate(task.id.clone())
                } else {
                    storage(e)
                }
            })
    }

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, TaskStoreError> {
        GenerationTaskRepo::find_by_id(&self.pool, task_id)
            .await
            .map_err(storage)
    }

    async fn advance(&self, task_id: &str, next: TaskStatus) -> Result<bool, TaskStoreError> {
        GenerationTaskRepo::advance(&self.pool, task_id, next)
            .await
            .map_err(storage)
    }

    async fn mark_submitted(
        &self,
        task_id: &str,
        prompt_id: &str,
    ) -> Result<bool, TaskStoreError> {
        GenerationTaskRepo::mark_submitted(&self.pool, task_id, prompt_id)
            .await
            .map_err(storage)
    }

    async fn complete(
        &self,
        task_id: &str,
        image_source: &str,
        images: &serde_json::Value,
        actual_secs: i32,
    ) -> Result<bool, TaskStoreError> {
        GenerationTaskRepo::complete(&self.pool, task_id, image_source, images, actual_secs)
            .await
            .map_err(storage)
    }

    async fn fail(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: &str,
        actual_secs: i32,
    ) -> Result<bool, TaskStoreError> {
        GenerationTaskRepo::fail(&self.pool, task_id, status, error, actual_secs)
            .await
            .map_err(storage)
    }

    async fn mark_charged(&self, task_id: &str) -> Result<(), TaskStoreError> {
        GenerationTaskRepo::mark_charged(&self.pool, task_id)
            .await
            .map_err(storage)
    }

    async fn record_billing_error(
        &self,
        task_id: &str,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        GenerationTaskRepo::record_billing_error(&self.pool, task_id, error)
            .await
            .map_err(storage)
    }

    async fn list_unbilled(
        &self,
        grace_secs: i64,
        limit: i64,
    ) -> Result<Vec<GenerationTask>, TaskStoreError> {
        GenerationTaskRepo::list_unbilled(&self.pool, grace_secs, limit)
            .await
            .map_err(storage)
    }
}
