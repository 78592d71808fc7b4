//! Concurrent postings against one account never overdraw it.

use std::sync::Arc;

use atelier_core::credits::ReferenceType;
use atelier_pipeline::ledger::{CreditLedger, HistoryQuery, LedgerError, MemoryCreditLedger};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spends_stop_at_zero() {
    let ledger = Arc::new(MemoryCreditLedger::new());
    ledger.open_account(1, 100);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let reference = format!("task_{i}");
                ledger
                    .spend(1, 15, "gen", Some(&reference), ReferenceType::ImageGeneration)
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

    // 100 / 15 = 6 debits fit.
    assert_eq!(succeeded, 6);
    let stats = ledger.stats(1).await.unwrap();
    assert_eq!(stats.current_credits, 10);
    assert_eq!(stats.current_credits, stats.total_earned - stats.total_spent);

    let page = ledger
        .history(1, &HistoryQuery { page: 1, page_size: 100, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.total, 6);
    for tx in &page.transactions {
        assert_eq!(tx.balance_after, tx.balance_before + tx.amount);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_spends_for_one_reference_charge_once() {
    let ledger = Arc::new(MemoryCreditLedger::new());
    ledger.open_account(1, 100);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                ledger
                    .spend(1, 15, "gen", Some("task_shared"), ReferenceType::ImageGeneration)
                    .await
            })
        })
        .collect();

    let mut charged = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => charged += 1,
            Err(LedgerError::AlreadyCharged(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(charged, 1);
    assert_eq!(ledger.balance(1).await.unwrap(), 85);
}
