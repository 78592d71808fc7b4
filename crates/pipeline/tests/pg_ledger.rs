//! PostgreSQL ledger and task store behaviour under concurrency.
//!
//! Run with `DATABASE_URL` set: `cargo test -p atelier-pipeline -- --ignored`.

use std::sync::Arc;

use atelier_core::credits::ReferenceType;
use atelier_core::types::DbId;
use atelier_db::models::generation_task::NewGenerationTask;
use atelier_db::models::status::TaskStatus;
use atelier_pipeline::ledger::{CreditLedger, LedgerError, PgCreditLedger};
use atelier_pipeline::reconciliation::reconcile_once;
use atelier_pipeline::tasks::{PgTaskStore, TaskStore, TaskStoreError};
use sqlx::PgPool;

async fn insert_user(pool: &PgPool, username: &str, credits: i64) -> DbId {
    sqlx::query_scalar(
        "INSERT INTO users (username, credits, total_earned) VALUES ($1, $2, $2) RETURNING id",
    )
    .bind(username)
    .bind(credits)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn concurrent_spends_never_overdraw(pool: PgPool) {
    let user_id = insert_user(&pool, "carol", 100).await;
    let ledger = Arc::new(PgCreditLedger::new(pool.clone()));

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let reference = format!("task_{i}");
                ledger
                    .spend(user_id, 15, "gen", Some(&reference), ReferenceType::ImageGeneration)
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientCredits { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(succeeded, 6);
    let stats = ledger.stats(user_id).await.unwrap();
    assert_eq!(stats.current_credits, 10);
    assert_eq!(stats.current_credits, stats.total_earned - stats.total_spent);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn duplicate_reference_is_already_charged(pool: PgPool) {
    let user_id = insert_user(&pool, "dave", 100).await;
    let ledger = PgCreditLedger::new(pool);

    ledger
        .spend(user_id, 15, "gen", Some("task_x"), ReferenceType::ImageGeneration)
        .await
        .unwrap();
    let second = ledger
        .spend(user_id, 15, "gen", Some("task_x"), ReferenceType::ImageGeneration)
        .await;
    assert!(matches!(second, Err(LedgerError::AlreadyCharged(_))));
    assert_eq!(ledger.balance(user_id).await.unwrap(), 85);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn reconciliation_charges_flagged_task(pool: PgPool) {
    let user_id = insert_user(&pool, "erin", 100).await;
    let ledger = PgCreditLedger::new(pool.clone());
    let tasks = PgTaskStore::new(pool.clone());

    let new_task = || NewGenerationTask {
        id: "task_unbilled".into(),
        user_id,
        workflow: "text2img".into(),
        parameters: serde_json::json!({}),
        cost: 15,
        estimated_secs: 27,
    };
    tasks.create(new_task()).await.unwrap();
    assert!(matches!(
        tasks.create(new_task()).await,
        Err(TaskStoreError::Duplicate(_))
    ));

    tasks.advance("task_unbilled", TaskStatus::Rendering).await.unwrap();
    tasks
        .complete("task_unbilled", "engine", &serde_json::json!([]), 4)
        .await
        .unwrap();
    tasks
        .record_billing_error("task_unbilled", "pool timed out")
        .await
        .unwrap();

    let report = reconcile_once(&tasks, &ledger, 0).await;
    assert_eq!(report.charged, 1);
    assert_eq!(ledger.balance(user_id).await.unwrap(), 85);

    let task = tasks.get("task_unbilled").await.unwrap().unwrap();
    assert!(task.credits_charged);
    assert!(task.billing_error.is_none());
}
