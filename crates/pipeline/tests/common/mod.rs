//! Scripted engine, image store and ledger doubles shared by the
//! orchestrator tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use atelier_comfyui::api::ImageDescriptor;
use atelier_comfyui::events::EngineEvent;
use atelier_core::credits::{BalanceChange, CreditStats};
use atelier_core::generation::GenerationRequest;
use atelier_core::types::{Credits, DbId};
use atelier_db::models::credit::TransactionPage;
use atelier_pipeline::engine::{EngineError, GenerationEngine};
use atelier_pipeline::ledger::{CreditLedger, HistoryQuery, LedgerError, MemoryCreditLedger, Posting};
use atelier_pipeline::orchestrator::{Orchestrator, OrchestratorConfig};
use atelier_pipeline::progress::ProgressRouter;
use atelier_pipeline::storage::{ImageStore, StorageError, StoredImage};
use atelier_pipeline::tasks::MemoryTaskStore;
use atelier_pipeline::template::TemplateEngine;
use serde_json::Value;

pub const USER: DbId = 1;

pub fn workflows_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../workflows"))
}

pub fn templates() -> TemplateEngine {
    TemplateEngine::load_dir(&workflows_dir()).unwrap()
}

pub fn request(batch_size: i32) -> GenerationRequest {
    serde_json::from_value(serde_json::json!({
        "prompt": "a lighthouse at dusk",
        "model": "sd_xl_base_1.0.safetensors",
        "sampler": "euler",
        "batchSize": batch_size,
        "seed": 42,
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What the engine does after accepting a job.
#[derive(Debug, Clone)]
pub enum Script {
    Complete,
    Fail(String),
    Hang,
}

pub struct FakeEngine {
    router: Arc<ProgressRouter>,
    pub healthy: bool,
    /// Held inside `check_health`, so concurrent requests all pass the
    /// balance check before any of them debits.
    pub health_delay: Option<Duration>,
    pub reject_submit: bool,
    pub script: Script,
    pub outputs: usize,
    pub submits: AtomicUsize,
    pub last_job: Mutex<Option<Value>>,
}

impl FakeEngine {
    pub fn new(router: Arc<ProgressRouter>, script: Script) -> Self {
        Self {
            router,
            healthy: true,
            health_delay: None,
            reject_submit: false,
            script,
            outputs: 2,
            submits: AtomicUsize::new(0),
            last_job: Mutex::new(None),
        }
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationEngine for FakeEngine {
    async fn check_health(&self) -> bool {
        if let Some(delay) = self.health_delay {
            tokio::time::sleep(delay).await;
        }
        self.healthy
    }

    async fn submit(&self, job: &Value) -> Result<String, EngineError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_job.lock().unwrap() = Some(job.clone());
        if self.reject_submit {
            return Err(EngineError::Submit(r#"{"error":"invalid prompt"}"#.into()));
        }
        let prompt_id = format!("prompt-{n}");

        // Delivered before the orchestrator binds the prompt, like a very
        // fast engine.
        match &self.script {
            Script::Complete => self.router.dispatch(EngineEvent::Completed {
                prompt_id: Some(prompt_id.clone()),
            }),
            Script::Fail(message) => self.router.dispatch(EngineEvent::Failed {
                prompt_id: prompt_id.clone(),
                node_id: Some("3".into()),
                message: message.clone(),
            }),
            Script::Hang => {}
        }
        Ok(prompt_id)
    }

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<ImageDescriptor>, EngineError> {
        Ok((0..self.outputs)
            .map(|i| ImageDescriptor {
                filename: format!("{job_id}_{i:05}_.png"),
                subfolder: String::new(),
                image_type: "output".into(),
                url: format!("http://engine.test/view?filename={job_id}_{i:05}_.png"),
            })
            .collect())
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["sd_xl_base_1.0.safetensors".into()])
    }

    async fn list_samplers(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["euler".into()])
    }
}

// ---------------------------------------------------------------------------
// Image store
// ---------------------------------------------------------------------------

/// Stores everything except files whose name contains `fail_on`.
#[derive(Default)]
pub struct FakeImageStore {
    pub fail_on: Option<String>,
}

#[async_trait]
impl ImageStore for FakeImageStore {
    async fn save(&self, image: &ImageDescriptor) -> Result<StoredImage, StorageError> {
        if self
            .fail_on
            .as_deref()
            .is_some_and(|pattern| image.filename.contains(pattern))
        {
            return Err(StorageError::Download("connection reset".into()));
        }
        Ok(StoredImage {
            url: format!("/uploads/temp/copy_{}", image.filename),
            filename: format!("copy_{}", image.filename),
            file_size: 1024,
            width: 512,
            height: 512,
        })
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Reads pass through; every posting fails with a storage error.
pub struct BrokenWrites {
    pub inner: MemoryCreditLedger,
}

#[async_trait]
impl CreditLedger for BrokenWrites {
    async fn record(&self, _posting: Posting<'_>) -> Result<BalanceChange, LedgerError> {
        Err(LedgerError::Storage("connection pool timed out".into()))
    }

    async fn balance(&self, user_id: DbId) -> Result<Credits, LedgerError> {
        self.inner.balance(user_id).await
    }

    async fn stats(&self, user_id: DbId) -> Result<CreditStats, LedgerError> {
        self.inner.stats(user_id).await
    }

    async fn history(
        &self,
        user_id: DbId,
        query: &HistoryQuery,
    ) -> Result<TransactionPage, LedgerError> {
        self.inner.history(user_id, query).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub router: Arc<ProgressRouter>,
    pub engine: Arc<FakeEngine>,
    pub ledger: Arc<dyn CreditLedger>,
    pub tasks: Arc<MemoryTaskStore>,
}

pub struct HarnessBuilder {
    balance: Credits,
    script: Script,
    healthy: bool,
    health_delay: Option<Duration>,
    reject_submit: bool,
    outputs: usize,
    fail_copy: Option<String>,
    broken_ledger: bool,
    timeout: Duration,
}

impl HarnessBuilder {
    pub fn new(balance: Credits) -> Self {
        Self {
            balance,
            script: Script::Complete,
            healthy: true,
            health_delay: None,
            reject_submit: false,
            outputs: 2,
            fail_copy: None,
            broken_ledger: false,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn slow_health_check(mut self, delay: Duration) -> Self {
        self.health_delay = Some(delay);
        self
    }

    pub fn reject_submit(mut self) -> Self {
        self.reject_submit = true;
        self
    }

    pub fn outputs(mut self, outputs: usize) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn fail_copy(mut self, pattern: &str) -> Self {
        self.fail_copy = Some(pattern.to_string());
        self
    }

    pub fn broken_ledger(mut self) -> Self {
        self.broken_ledger = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Harness {
        let router = ProgressRouter::new();

        let mut engine = FakeEngine::new(Arc::clone(&router), self.script);
        engine.healthy = self.healthy;
        engine.health_delay = self.health_delay;
        engine.reject_submit = self.reject_submit;
        engine.outputs = self.outputs;
        let engine = Arc::new(engine);

        let memory = MemoryCreditLedger::new();
        memory.open_account(USER, self.balance);
        let ledger: Arc<dyn CreditLedger> = if self.broken_ledger {
            Arc::new(BrokenWrites { inner: memory })
        } else {
            Arc::new(memory)
        };

        let tasks = Arc::new(MemoryTaskStore::new());
        let images = Arc::new(FakeImageStore {
            fail_on: self.fail_copy,
        });

        let orchestrator = Orchestrator::new(
            templates(),
            engine.clone(),
            Arc::clone(&router),
            Arc::clone(&ledger),
            tasks.clone(),
            images,
            OrchestratorConfig {
                generation_timeout: self.timeout,
            },
        );

        Harness {
            orchestrator,
            router,
            engine,
            ledger,
            tasks,
        }
    }
}
