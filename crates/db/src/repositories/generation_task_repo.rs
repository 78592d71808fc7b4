//! Repository for the `generation_tasks` table.
//!
//! Every status change is a conditional UPDATE on the expected prior
//! status, so a terminal status is written exactly once even when the
//! orchestrator and a cleanup path race.

use sqlx::PgPool;

use crate::models::generation_task::{GenerationTask, NewGenerationTask};
use crate::models::status::{StatusId, TaskStatus};

/// Column list for `generation_tasks` queries.
const COLUMNS: &str = "\
    id, user_id, status_id, workflow, parameters, cost, \
    estimated_secs, actual_secs, prompt_id, image_source, images, \
    credits_charged, billing_error, error_message, \
    created_at, submitted_at, completed_at, updated_at";

fn status_ids(statuses: &[TaskStatus]) -> Vec<StatusId> {
    statuses.iter().map(|s| s.id()).collect()
}

pub struct GenerationTaskRepo;

impl GenerationTaskRepo {
    /// Insert a new `pending` task.
    pub async fn create(
        pool: &PgPool,
        input: &NewGenerationTask,
    ) -> Result<GenerationTask, sqlx::Error> {
        let query = format!(
            "INSERT INTO generation_tasks \
                 (id, user_id, status_id, workflow, parameters, cost, estimated_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(&input.id)
            .bind(input.user_id)
            .bind(TaskStatus::Pending.id())
            .bind(&input.workflow)
            .bind(&input.parameters)
            .bind(input.cost)
            .bind(input.estimated_secs)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        task_id: &str,
    ) -> Result<Option<GenerationTask>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM generation_tasks WHERE id = $1");
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(task_id)
            .fetch_optional(pool)
            .await
    }

    /// Move a task to a non-terminal status.
    ///
    /// Returns `false` if the task was not in an allowed predecessor status.
    pub async fn advance(
        pool: &PgPool,
        task_id: &str,
        next: TaskStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status_id = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(task_id)
        .bind(next.id())
        .bind(status_ids(next.allowed_predecessors()))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `rendering -> submitted`, recording the engine's job id.
    pub async fn mark_submitted(
        pool: &PgPool,
        task_id: &str,
        prompt_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status_id = $2, prompt_id = $3, submitted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(task_id)
        .bind(TaskStatus::Submitted.id())
        .bind(prompt_id)
        .bind(TaskStatus::Rendering.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal success with the collected image references.
    pub async fn complete(
        pool: &PgPool,
        task_id: &str,
        image_source: &str,
        images: &serde_json::Value,
        actual_secs: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status_id = $2, image_source = $3, images = $4, actual_secs = $5, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($6)",
        )
        .bind(task_id)
        .bind(TaskStatus::Completed.id())
        .bind(image_source)
        .bind(images)
        .bind(actual_secs)
        .bind(status_ids(&TaskStatus::ACTIVE))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure (`failed` or `timed_out`).
    pub async fn fail(
        pool: &PgPool,
        task_id: &str,
        status: TaskStatus,
        error: &str,
        actual_secs: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status_id = $2, error_message = $3, actual_secs = $4, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($5)",
        )
        .bind(task_id)
        .bind(status.id())
        .bind(error)
        .bind(actual_secs)
        .bind(status_ids(&TaskStatus::ACTIVE))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that the debit for a completed task landed.
    pub async fn mark_charged(pool: &PgPool, task_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_tasks \
             SET credits_charged = TRUE, billing_error = NULL, updated_at = NOW() \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(task_id)
        .bind(TaskStatus::Completed.id())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record why the debit for a completed task did not land.
    pub async fn record_billing_error(
        pool: &PgPool,
        task_id: &str,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_tasks \
             SET billing_error = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 AND credits_charged = FALSE",
        )
        .bind(task_id)
        .bind(error)
        .bind(TaskStatus::Completed.id())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Completed tasks still waiting for their debit, oldest first.
    ///
    /// Only tasks completed more than `grace_secs` ago are returned so the
    /// sweep does not race the request that is about to debit.
    pub async fn list_unbilled(
        pool: &PgPool,
        grace_secs: i64,
        limit: i64,
    ) -> Result<Vec<GenerationTask>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_tasks \
             WHERE status_id = $1 AND credits_charged = FALSE \
               AND completed_at < NOW() - make_interval(secs => $2) \
             ORDER BY completed_at ASC \
             LIMIT $3"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(TaskStatus::Completed.id())
            .bind(grace_secs as f64)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
