//! Periodic retry of debits that failed after a successful generation.
//!
//! Spawns a loop that lists completed tasks still flagged
//! `credits_charged = false` and re-attempts their debit with the task id
//! as the reference. The ledger's exactly-once reference check makes the
//! retry safe against a debit that actually landed.

use std::sync::Arc;
use std::time::Duration;

use atelier_core::credits::ReferenceType;
use tokio_util::sync::CancellationToken;

use crate::images::ImageSource;
use crate::ledger::{CreditLedger, LedgerError};
use crate::tasks::TaskStore;

/// How often the sweep runs by default.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300); // 5 minutes

/// Tasks completed more recently than this are left to their request.
pub const RECONCILE_GRACE_SECS: i64 = 60;

/// Upper bound on tasks handled per sweep.
const BATCH_LIMIT: i64 = 100;

/// Outcome counts of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub charged: usize,
    pub already_charged: usize,
    pub failed: usize,
}

/// Run one sweep.
pub async fn reconcile_once(
    tasks: &dyn TaskStore,
    ledger: &dyn CreditLedger,
    grace_secs: i64,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let unbilled = match tasks.list_unbilled(grace_secs, BATCH_LIMIT).await {
        Ok(unbilled) => unbilled,
        Err(e) => {
            tracing::error!(error = %e, "Reconciliation: listing unbilled tasks failed");
            return report;
        }
    };

    for task in unbilled {
        let reference_type = if task.image_source.as_deref() == Some(ImageSource::Mock.as_str()) {
            ReferenceType::ImageGenerationMock
        } else {
            ReferenceType::ImageGeneration
        };
        let description = format!("AI image generation (reconciled) - task {}", task.id);

        let result = ledger
            .spend(task.user_id, task.cost, &description, Some(&task.id), reference_type)
            .await;

        match result {
            Ok(change) => {
                report.charged += 1;
                tracing::info!(
                    task_id = %task.id,
                    user_id = task.user_id,
                    cost = task.cost,
                    balance_after = change.balance_after,
                    "Reconciliation: debit recovered",
                );
            }
            Err(LedgerError::AlreadyCharged(_)) => {
                report.already_charged += 1;
                tracing::info!(task_id = %task.id, "Reconciliation: task was already charged");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    task_id = %task.id,
                    user_id = task.user_id,
                    error = %e,
                    "Reconciliation: debit still failing",
                );
                if let Err(store_err) = tasks.record_billing_error(&task.id, &e.to_string()).await {
                    tracing::error!(task_id = %task.id, error = %store_err, "Reconciliation: flag update failed");
                }
                continue;
            }
        }

        if let Err(e) = tasks.mark_charged(&task.id).await {
            tracing::error!(task_id = %task.id, error = %e, "Reconciliation: marking charged failed");
        }
    }

    report
}

/// Run the reconciliation loop until `cancel` is triggered.
pub async fn run(
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<dyn CreditLedger>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Billing reconciliation job started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Billing reconciliation job stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = reconcile_once(tasks.as_ref(), ledger.as_ref(), RECONCILE_GRACE_SECS).await;
                if report == ReconcileReport::default() {
                    tracing::debug!("Reconciliation: nothing to do");
                } else {
                    tracing::info!(
                        charged = report.charged,
                        already_charged = report.already_charged,
                        failed = report.failed,
                        "Reconciliation sweep finished",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use atelier_db::models::generation_task::NewGenerationTask;
    use atelier_db::models::status::TaskStatus;

    use super::*;
    use crate::ledger::MemoryCreditLedger;
    use crate::tasks::MemoryTaskStore;

    async fn completed_unbilled(store: &MemoryTaskStore, id: &str, source: &str) {
        store
            .create(NewGenerationTask {
                id: id.into(),
                user_id: 1,
                workflow: "text2img".into(),
                parameters: serde_json::json!({}),
                cost: 15,
                estimated_secs: 27,
            })
            .await
            .unwrap();
        store.advance(id, TaskStatus::Rendering).await.unwrap();
        store
            .complete(id, source, &serde_json::json!([]), 3)
            .await
            .unwrap();
        store.backdate_completion(id, 600);
    }

    #[tokio::test]
    async fn sweep_charges_unbilled_tasks_once() {
        let store = MemoryTaskStore::new();
        let ledger = MemoryCreditLedger::new();
        ledger.open_account(1, 100);
        completed_unbilled(&store, "t1", "engine").await;
        completed_unbilled(&store, "t2", "mock").await;

        let report = reconcile_once(&store, &ledger, 60).await;
        assert_eq!(report.charged, 2);
        assert_eq!(ledger.balance(1).await.unwrap(), 70);
        assert!(store.get("t1").await.unwrap().unwrap().credits_charged);

        let again = reconcile_once(&store, &ledger, 60).await;
        assert_eq!(again, ReconcileReport::default());
        assert_eq!(ledger.balance(1).await.unwrap(), 70);
    }

    #[tokio::test]
    async fn debit_that_already_landed_is_only_flagged() {
        let store = MemoryTaskStore::new();
        let ledger = MemoryCreditLedger::new();
        ledger.open_account(1, 100);
        completed_unbilled(&store, "t1", "engine").await;
        ledger
            .spend(1, 15, "original", Some("t1"), ReferenceType::ImageGeneration)
            .await
            .unwrap();

        let report = reconcile_once(&store, &ledger, 60).await;
        assert_eq!(report.already_charged, 1);
        assert_eq!(ledger.balance(1).await.unwrap(), 85);
        assert!(store.get("t1").await.unwrap().unwrap().credits_charged);
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_flag_for_next_sweep() {
        let store = MemoryTaskStore::new();
        let ledger = MemoryCreditLedger::new();
        ledger.open_account(1, 5);
        completed_unbilled(&store, "t1", "engine").await;

        let report = reconcile_once(&store, &ledger, 60).await;
        assert_eq!(report.failed, 1);
        let task = store.get("t1").await.unwrap().unwrap();
        assert!(!task.credits_charged);
        assert!(task.billing_error.is_some());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let ledger: Arc<dyn CreditLedger> = Arc::new(MemoryCreditLedger::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(store, ledger, Duration::from_secs(3600), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
