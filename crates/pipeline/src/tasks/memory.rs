//! In-process [`TaskStore`] with the same transition rules as the
//! database.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use atelier_db::models::generation_task::{GenerationTask, NewGenerationTask};
use atelier_db::models::status::TaskStatus;
use chrono::Utc;

use super::{TaskStore, TaskStoreError};

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, GenerationTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GenerationTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` if the task exists and may move to `next`.
    fn transition(
        &self,
        task_id: &str,
        next: TaskStatus,
        update: impl FnOnce(&mut GenerationTask),
    ) -> bool {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        let allowed = task
            .status()
            .is_some_and(|current| current.can_transition_to(next));
        if !allowed {
            return false;
        }
        let now = Utc::now();
        task.status_id = next.id();
        task.updated_at = now;
        if next.is_terminal() {
            task.completed_at = Some(now);
        }
        update(task);
        true
    }

    /// Backdate a task's completion, for exercising the reconciliation
    /// grace period.
    pub fn backdate_completion(&self, task_id: &str, secs: i64) {
        if let Some(task) = self.lock().get_mut(task_id) {
            if let Some(at) = task.completed_at.as_mut() {
                *at -= chrono::Duration::seconds(secs);
            }
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: NewGenerationTask) -> Result<GenerationTask, TaskStoreError> {
        let mut tasks = self.lock();
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::Duplicate(task.id));
        }
        let now = Utc::now();
        let row = GenerationTask {
            id: task.id.clone(),
            user_id: task.user_id,
            status_id: TaskStatus::Pending.id(),
            workflow: task.workflow,
            parameters: task.parameters,
            cost: task.cost,
            estimated_secs: task.estimated_secs,
            actual_secs: None,
            prompt_id: None,
            image_source: None,
            images: None,
            credits_charged: false,
            billing_error: None,
            error_message: None,
            created_at: now,
            submitted_at: None,
            completed_at: None,
            updated_at: now,
        };
        tasks.insert(task.id, row.clone());
        Ok(row)
    }

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, TaskStoreError> {
        Ok(self.lock().get(task_id).cloned())
    }

    async fn advance(&self, task_id: &str, next: TaskStatus) -> Result<bool, TaskStoreError> {
        if next.is_terminal() {
            return Ok(false);
        }
        Ok(self.transition(task_id, next, |_| {}))
    }

    async fn mark_submitted(
        &self,
        task_id: &str,
        prompt_id: &str,
    ) -> Result<bool, TaskStoreError> {
        Ok(self.transition(task_id, TaskStatus::Submitted, |task| {
            task.prompt_id = Some(prompt_id.to_string());
            task.submitted_at = Some(Utc::now());
        }))
    }

    async fn complete(
        &self,
        task_id: &str,
        image_source: &str,
        images: &serde_json::Value,
        actual_secs: i32,
    ) -> Result<bool, TaskStoreError> {
        Ok(self.transition(task_id, TaskStatus::Completed, |task| {
            task.image_source = Some(image_source.to_string());
            task.images = Some(images.clone());
            task.actual_secs = Some(actual_secs);
        }))
    }

    async fn fail(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: &str,
        actual_secs: i32,
    ) -> Result<bool, TaskStoreError> {
        Ok(self.transition(task_id, status, |task| {
            task.error_message = Some(error.to_string());
            task.actual_secs = Some(actual_secs);
        }))
    }

    async fn mark_charged(&self, task_id: &str) -> Result<(), TaskStoreError> {
        if let Some(task) = self.lock().get_mut(task_id) {
            if task.status() == Some(TaskStatus::Completed) {
                task.credits_charged = true;
                task.billing_error = None;
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn record_billing_error(
        &self,
        task_id: &str,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        if let Some(task) = self.lock().get_mut(task_id) {
            if task.status() == Some(TaskStatus::Completed) && !task.credits_charged {
                task.billing_error = Some(error.to_string());
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn list_unbilled(
        &self,
        grace_secs: i64,
        limit: i64,
    ) -> Result<Vec<GenerationTask>, TaskStoreError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(grace_secs);
        let mut unbilled: Vec<GenerationTask> = self
            .lock()
            .values()
            .filter(|t| t.status() == Some(TaskStatus::Completed) && !t.credits_charged)
            .filter(|t| t.completed_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        unbilled.sort_by_key(|t| t.completed_at);
        unbilled.truncate(limit.max(0) as usize);
        Ok(unbilled)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn new_task(id: &str) -> NewGenerationTask {
        NewGenerationTask {
            id: id.into(),
            user_id: 1,
            workflow: "text2img".into(),
            parameters: serde_json::json!({}),
            cost: 15,
            estimated_secs: 27,
        }
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = MemoryTaskStore::new();
        store.create(new_task("t1")).await.unwrap();
        assert_matches!(
            store.create(new_task("t1")).await,
            Err(TaskStoreError::Duplicate(_))
        );
    }

    #[tokio::test]
    async fn walk_to_completion_writes_terminal_once() {
        let store = MemoryTaskStore::new();
        store.create(new_task("t1")).await.unwrap();

        assert!(store.advance("t1", TaskStatus::Rendering).await.unwrap());
        assert!(store.mark_submitted("t1", "p1").await.unwrap());
        assert!(store.advance("t1", TaskStatus::Running).await.unwrap());
        assert!(store
            .complete("t1", "engine", &serde_json::json!([]), 12)
            .await
            .unwrap());

        // A racing failure after completion changes nothing.
        assert!(!store
            .fail("t1", TaskStatus::TimedOut, "late", 600)
            .await
            .unwrap());

        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status(), Some(TaskStatus::Completed));
        assert_eq!(task.prompt_id.as_deref(), Some("p1"));
        assert!(task.error_message.is_none());
    }

    #[tokio::test]
    async fn skipping_a_step_is_refused() {
        let store = MemoryTaskStore::new();
        store.create(new_task("t1")).await.unwrap();
        assert!(!store.mark_submitted("t1", "p1").await.unwrap());
        assert!(!store.advance("t1", TaskStatus::Completed).await.unwrap());
    }

    #[tokio::test]
    async fn unbilled_respects_grace_and_charged_flag() {
        let store = MemoryTaskStore::new();
        for id in ["old", "fresh", "charged"] {
            store.create(new_task(id)).await.unwrap();
            store.advance(id, TaskStatus::Rendering).await.unwrap();
            store.complete(id, "mock", &serde_json::json!([]), 1).await.unwrap();
        }
        store.backdate_completion("old", 600);
        store.backdate_completion("charged", 600);
        store.mark_charged("charged").await.unwrap();

        let unbilled = store.list_unbilled(60, 10).await.unwrap();
        let ids: Vec<&str> = unbilled.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[tokio::test]
    async fn billing_error_only_on_uncharged_completed() {
        let store = MemoryTaskStore::new();
        store.create(new_task("t1")).await.unwrap();
        store.record_billing_error("t1", "db down").await.unwrap();
        assert!(store.get("t1").await.unwrap().unwrap().billing_error.is_none());

        store.advance("t1", TaskStatus::Rendering).await.unwrap();
        store.complete("t1", "engine", &serde_json::json!([]), 1).await.unwrap();
        store.record_billing_error("t1", "db down").await.unwrap();
        assert_eq!(
            store.get("t1").await.unwrap().unwrap().billing_error.as_deref(),
            Some("db down")
        );

        store.mark_charged("t1").await.unwrap();
        let task = store.get("t1").await.unwrap().unwrap();
        assert!(task.credits_charged);
        assert!(task.billing_error.is_none());
    }
}
