//! Task orchestrator: runs one generation request from credit check to
//! billed result.
//!
//! ```text
//! validate -> balance guard -> pending -> rendering -> submitted -> running
//!                                              |                      |
//!                              (engine down)   v                      v
//!                                            mock ------------> completed
//!                                                        failed | timed_out
//! ```
//!
//! Billing policy: the mock path debits before placeholders are built; the
//! engine path debits only after images are collected. Failures and
//! timeouts never debit. The balance check at entry is advisory: if a
//! concurrent request of the same user spent the balance first, the debit
//! refuses and the request fails with `InsufficientCredits`, results
//! withheld. Any other debit failure after a successful generation is
//! logged, flagged on the task for the reconciliation sweep, and does not
//! fail the request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use atelier_comfyui::api::ImageDescriptor;
use atelier_core::credits::ReferenceType;
use atelier_core::error::CoreError;
use atelier_core::generation::{
    generate_task_id, resolve_request, GenerationRequest, ResolvedGeneration,
    GENERATION_TIMEOUT_SECS,
};
use atelier_core::types::{Credits, DbId};
use atelier_db::models::generation_task::{GenerationTask, NewGenerationTask};
use atelier_db::models::status::TaskStatus;
use serde::Serialize;

use crate::engine::GenerationEngine;
use crate::images::{GeneratedImageRef, ImageSource};
use crate::ledger::{CreditLedger, LedgerError};
use crate::mock::mock_images;
use crate::progress::{ProgressRouter, Terminal};
use crate::storage::ImageStore;
use crate::tasks::{TaskStore, TaskStoreError};
use crate::template::{build_generation_params, node_titles, RenderError, TemplateEngine};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on waiting for the engine once a job is submitted.
    pub generation_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(GENERATION_TIMEOUT_SECS),
        }
    }
}

/// Who produced the images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Provider {
    #[serde(rename = "ComfyUI")]
    ComfyUI,
    Mock,
}

/// Result of a successful generation, as returned to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub task_id: String,
    pub images: Vec<GeneratedImageRef>,
    pub config: ResolvedGeneration,
    pub credits_used: Credits,
    /// `None` when the debit did not land.
    pub credits_remaining: Option<Credits>,
    pub estimated_time: i32,
    pub actual_time: i32,
    pub batch_size: i32,
    pub workflow: String,
    pub provider: Provider,
    /// Why the debit failed, if it did. Internal only.
    #[serde(skip)]
    pub billing_error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Workflow render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Generation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Generation failed: {0}")]
    Failed(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Task store error: {0}")]
    Store(String),
}

impl From<LedgerError> for OrchestratorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Storage(msg) => OrchestratorError::Ledger(msg),
            other => OrchestratorError::Core(other.into()),
        }
    }
}

impl From<TaskStoreError> for OrchestratorError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::Storage(msg) => OrchestratorError::Store(msg),
            other => OrchestratorError::Core(other.into()),
        }
    }
}

/// How the debit for a finished task went.
enum Billing {
    /// Charged now or earlier; carries the balance afterwards if known.
    Charged(Option<Credits>),
    /// The ledger failed; the reason is flagged on the task.
    Unbilled(String),
}

fn elapsed_secs(started: Instant) -> i32 {
    i32::try_from(started.elapsed().as_secs()).unwrap_or(i32::MAX)
}

// ---------------------------------------------------------------------------
// Cancellation guard
// ---------------------------------------------------------------------------

/// Fails the task in a detached cleanup if the request future is dropped
/// before it finished.
struct TaskGuard {
    tasks: Arc<dyn TaskStore>,
    task_id: String,
    started: Instant,
    armed: bool,
}

impl TaskGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tasks = Arc::clone(&self.tasks);
        let task_id = std::mem::take(&mut self.task_id);
        let secs = elapsed_secs(self.started);
        handle.spawn(async move {
            match tasks
                .fail(&task_id, TaskStatus::Failed, "Request cancelled", secs)
                .await
            {
                Ok(true) => tracing::info!(task_id = %task_id, "Cancelled task marked failed"),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to mark cancelled task")
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    templates: TemplateEngine,
    engine: Arc<dyn GenerationEngine>,
    router: Arc<ProgressRouter>,
    ledger: Arc<dyn CreditLedger>,
    tasks: Arc<dyn TaskStore>,
    images: Arc<dyn ImageStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        templates: TemplateEngine,
        engine: Arc<dyn GenerationEngine>,
        router: Arc<ProgressRouter>,
        ledger: Arc<dyn CreditLedger>,
        tasks: Arc<dyn TaskStore>,
        images: Arc<dyn ImageStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            templates,
            engine,
            router,
            ledger,
            tasks,
            images,
            config,
        }
    }

    /// Run one generation request for `user_id`.
    pub async fn generate(
        &self,
        user_id: DbId,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, OrchestratorError> {
        let generation = resolve_request(request)?;
        let task_id = request.task_id.clone().unwrap_or_else(generate_task_id);
        let cost = generation.total_cost();

        let balance = self.ledger.balance(user_id).await?;
        if balance < cost {
            tracing::info!(user_id, balance, required = cost, "Generation refused: insufficient credits");
            return Err(CoreError::InsufficientCredits {
                balance,
                required: cost,
            }
            .into());
        }

        let parameters =
            serde_json::to_value(&generation).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.tasks
            .create(NewGenerationTask {
                id: task_id.clone(),
                user_id,
                workflow: generation.workflow.as_str().to_string(),
                parameters,
                cost,
                estimated_secs: generation.estimated_secs(),
            })
            .await?;

        tracing::info!(
            task_id = %task_id,
            user_id,
            workflow = generation.workflow.as_str(),
            batch_size = generation.batch_size,
            cost,
            "Generation accepted",
        );

        let started = Instant::now();
        let mut guard = TaskGuard {
            tasks: Arc::clone(&self.tasks),
            task_id: task_id.clone(),
            started,
            armed: true,
        };
        let result = self.run(user_id, &task_id, &generation, started).await;
        guard.disarm();

        if let Err(e) = &result {
            let status = match e {
                OrchestratorError::Timeout(_) => TaskStatus::TimedOut,
                _ => TaskStatus::Failed,
            };
            tracing::warn!(task_id = %task_id, status = status.name(), error = %e, "Generation did not complete");
            // No-op unless a client is still subscribed.
            self.router.finish(&task_id, Terminal::Failed(e.to_string()));
            if let Err(store_err) = self
                .tasks
                .fail(&task_id, status, &e.to_string(), elapsed_secs(started))
                .await
            {
                tracing::error!(task_id = %task_id, error = %store_err, "Failed to record task failure");
            }
        }
        result
    }

    /// A stored task, visible only to its owner.
    pub async fn task_status(
        &self,
        user_id: DbId,
        task_id: &str,
    ) -> Result<GenerationTask, OrchestratorError> {
        self.tasks
            .get(task_id)
            .await?
            .filter(|task| task.user_id == user_id)
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "GenerationTask",
                    id: task_id.to_string(),
                }
                .into()
            })
    }

    async fn run(
        &self,
        user_id: DbId,
        task_id: &str,
        generation: &ResolvedGeneration,
        started: Instant,
    ) -> Result<GenerationOutcome, OrchestratorError> {
        self.transition(task_id, TaskStatus::Rendering).await?;
        let job = self.templates.render(
            generation.workflow.template_name(),
            &build_generation_params(generation),
        )?;

        if !self.engine.check_health().await {
            tracing::warn!(task_id, "Engine unhealthy, using mock generator");
            return self.finish_mock(user_id, task_id, generation, started).await;
        }

        let prompt_id = match self.engine.submit(&job).await {
            Ok(prompt_id) => prompt_id,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Engine submission failed, using mock generator");
                return self.finish_mock(user_id, task_id, generation, started).await;
            }
        };

        let mut watch = self.router.watch(task_id);
        self.router.bind_prompt(task_id, &prompt_id, node_titles(&job));
        if !self.tasks.mark_submitted(task_id, &prompt_id).await? {
            tracing::warn!(task_id, prompt_id = %prompt_id, "Task was not rendering at submit");
        }
        self.transition(task_id, TaskStatus::Running).await?;
        tracing::info!(task_id, prompt_id = %prompt_id, "Waiting for engine");

        let terminal = match tokio::time::timeout(self.config.generation_timeout, watch.recv()).await
        {
            Ok(Some(terminal)) => terminal,
            Ok(None) => {
                return Err(OrchestratorError::Failed(
                    "Completion watch was replaced".into(),
                ))
            }
            Err(_) => {
                let secs = self.config.generation_timeout.as_secs();
                self.router.finish(
                    task_id,
                    Terminal::Failed(format!("Generation timed out after {secs} seconds")),
                );
                return Err(OrchestratorError::Timeout(secs));
            }
        };
        if let Terminal::Failed(message) = terminal {
            return Err(OrchestratorError::Failed(message));
        }

        let descriptors = self
            .engine
            .fetch_result(&prompt_id)
            .await
            .map_err(|e| OrchestratorError::Failed(e.to_string()))?;
        if descriptors.is_empty() {
            return Err(OrchestratorError::Failed(
                "Engine finished without producing images".into(),
            ));
        }

        let (images, source) = self.collect_images(&descriptors, generation).await;
        let billing = self
            .charge(user_id, task_id, generation, Provider::ComfyUI)
            .await?;
        self.settle(task_id, generation, billing, images, source, Provider::ComfyUI, started)
            .await
    }

    async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<(), OrchestratorError> {
        if !self.tasks.advance(task_id, next).await? {
            tracing::warn!(task_id, status = next.name(), "Unexpected task status for transition");
        }
        Ok(())
    }

    async fn finish_mock(
        &self,
        user_id: DbId,
        task_id: &str,
        generation: &ResolvedGeneration,
        started: Instant,
    ) -> Result<GenerationOutcome, OrchestratorError> {
        let billing = self.charge(user_id, task_id, generation, Provider::Mock).await?;
        let images = mock_images(generation);
        let outcome = self
            .settle(task_id, generation, billing, images, ImageSource::Mock, Provider::Mock, started)
            .await?;
        // A client may be watching a task the engine never saw.
        self.router.finish(task_id, Terminal::Completed);
        Ok(outcome)
    }

    /// Copy each engine image into temp storage, falling back to the
    /// engine URL per image. The task-level source is `fallback-copy` if
    /// any copy failed.
    async fn collect_images(
        &self,
        descriptors: &[ImageDescriptor],
        generation: &ResolvedGeneration,
    ) -> (Vec<GeneratedImageRef>, ImageSource) {
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut source = ImageSource::Engine;
        let mut images = Vec::with_capacity(descriptors.len());

        for (index, descriptor) in descriptors.iter().enumerate() {
            let seed = generation.image_seed(index);
            let id = format!("img_{stamp}_{index}");
            let image = match self.images.save(descriptor).await {
                Ok(stored) => GeneratedImageRef {
                    id,
                    url: stored.url,
                    seed,
                    file_size: Some(stored.file_size),
                    width: stored.width,
                    height: stored.height,
                    source: ImageSource::Engine,
                    filename: Some(descriptor.filename.clone()),
                },
                Err(e) => {
                    tracing::warn!(
                        filename = %descriptor.filename,
                        error = %e,
                        "Temp copy failed, keeping engine URL",
                    );
                    source = ImageSource::FallbackCopy;
                    GeneratedImageRef {
                        id,
                        url: descriptor.url.clone(),
                        seed,
                        file_size: None,
                        width: generation.size.width,
                        height: generation.size.height,
                        source: ImageSource::FallbackCopy,
                        filename: Some(descriptor.filename.clone()),
                    }
                }
            };
            images.push(image);
        }
        (images, source)
    }

    /// Debit the task's cost.
    ///
    /// Losing the balance to a concurrent request of the same user fails
    /// the request with `InsufficientCredits`; any other ledger failure is
    /// returned as [`Billing::Unbilled`] for the task to be flagged.
    async fn charge(
        &self,
        user_id: DbId,
        task_id: &str,
        generation: &ResolvedGeneration,
        provider: Provider,
    ) -> Result<Billing, OrchestratorError> {
        let cost = generation.total_cost();
        let (reference_type, description) = match provider {
            Provider::ComfyUI => (
                ReferenceType::ImageGeneration,
                format!("AI image generation - {} image(s)", generation.batch_size),
            ),
            Provider::Mock => (
                ReferenceType::ImageGenerationMock,
                format!("AI image generation (mock) - {} image(s)", generation.batch_size),
            ),
        };

        match self
            .ledger
            .spend(user_id, cost, &description, Some(task_id), reference_type)
            .await
        {
            Ok(change) => {
                tracing::info!(
                    task_id,
                    user_id,
                    cost,
                    balance_after = change.balance_after,
                    "Generation charged",
                );
                Ok(Billing::Charged(Some(change.balance_after)))
            }
            Err(LedgerError::AlreadyCharged(_)) => {
                Ok(Billing::Charged(self.ledger.balance(user_id).await.ok()))
            }
            Err(e @ LedgerError::InsufficientCredits { .. }) => {
                tracing::warn!(
                    task_id,
                    user_id,
                    cost,
                    error = %e,
                    "Balance spent by a concurrent request, withholding results",
                );
                Err(e.into())
            }
            Err(e) => {
                tracing::error!(
                    task_id,
                    user_id,
                    cost,
                    error = %e,
                    "Debit failed after successful generation",
                );
                Ok(Billing::Unbilled(e.to_string()))
            }
        }
    }

    /// Record the terminal `completed` status and the billing outcome.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        task_id: &str,
        generation: &ResolvedGeneration,
        billing: Billing,
        images: Vec<GeneratedImageRef>,
        source: ImageSource,
        provider: Provider,
        started: Instant,
    ) -> Result<GenerationOutcome, OrchestratorError> {
        let images_json =
            serde_json::to_value(&images).map_err(|e| CoreError::Internal(e.to_string()))?;

        // The user may already have been charged: store failures are
        // logged, never returned.
        let actual_secs = elapsed_secs(started);
        match self
            .tasks
            .complete(task_id, source.as_str(), &images_json, actual_secs)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(task_id, "Task was no longer active at completion"),
            Err(e) => tracing::error!(task_id, error = %e, "Failed to record task completion"),
        }

        let (credits_remaining, billing_error) = match billing {
            Billing::Charged(remaining) => {
                self.flag_charged(task_id).await;
                (remaining, None)
            }
            Billing::Unbilled(reason) => {
                if let Err(store_err) = self.tasks.record_billing_error(task_id, &reason).await {
                    tracing::error!(task_id, error = %store_err, "Failed to flag billing error");
                }
                (None, Some(reason))
            }
        };

        Ok(GenerationOutcome {
            task_id: task_id.to_string(),
            images,
            config: generation.clone(),
            credits_used: generation.total_cost(),
            credits_remaining,
            estimated_time: generation.estimated_secs(),
            actual_time: actual_secs,
            batch_size: generation.batch_size,
            workflow: generation.workflow.template_name().to_string(),
            provider,
            billing_error,
        })
    }

    async fn flag_charged(&self, task_id: &str) {
        if let Err(e) = self.tasks.mark_charged(task_id).await {
            tracing::error!(task_id, error = %e, "Failed to flag task as charged");
        }
    }
}
