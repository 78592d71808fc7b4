//! In-process ledger for tests and database-less runs.
//!
//! Each account sits behind its own `tokio::sync::Mutex`, so postings for
//! one user are serialized and different users never contend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use atelier_core::credits::{total_pages, BalanceChange, CreditStats, TransactionKind};
use atelier_core::types::{Credits, DbId};
use atelier_db::models::credit::{CreditTransaction, TransactionPage};
use chrono::Utc;

use super::{counter_deltas, next_balance, CreditLedger, HistoryQuery, LedgerError, Posting};

#[derive(Debug, Default)]
struct Account {
    credits: Credits,
    total_earned: Credits,
    total_spent: Credits,
    transactions: Vec<CreditTransaction>,
}

#[derive(Default)]
pub struct MemoryCreditLedger {
    accounts: Mutex<HashMap<DbId, Arc<tokio::sync::Mutex<Account>>>>,
    charged: Mutex<HashSet<String>>,
    next_tx_id: AtomicI64,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) an account holding `credits`, counted as earned.
    pub fn open_account(&self, user_id: DbId, credits: Credits) {
        let account = Account {
            credits,
            total_earned: credits,
            ..Default::default()
        };
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, Arc::new(tokio::sync::Mutex::new(account)));
    }

    fn account(&self, user_id: DbId) -> Result<Arc<tokio::sync::Mutex<Account>>, LedgerError> {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    fn charged(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.charged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn record(&self, posting: Posting<'_>) -> Result<BalanceChange, LedgerError> {
        let account = self.account(posting.user_id)?;
        let mut account = account.lock().await;

        let spend_reference = match (posting.kind, posting.reference_id) {
            (TransactionKind::Spend, Some(reference)) => Some(reference),
            _ => None,
        };
        if let Some(reference) = spend_reference {
            if self.charged().contains(reference) {
                return Err(LedgerError::AlreadyCharged(reference.to_string()));
            }
        }

        let balance_before = account.credits;
        let balance_after = next_balance(balance_before, posting.amount)?;

        if let Some(reference) = spend_reference {
            if !self.charged().insert(reference.to_string()) {
                return Err(LedgerError::AlreadyCharged(reference.to_string()));
            }
        }

        let (earned, spent) = counter_deltas(posting.amount);
        account.credits = balance_after;
        account.total_earned += earned;
        account.total_spent += spent;
        account.transactions.push(CreditTransaction {
            id: self.next_tx_id.fetch_add(1, Ordering::Relaxed) + 1,
            user_id: posting.user_id,
            amount: posting.amount,
            balance_before,
            balance_after,
            transaction_type: posting.kind.as_str().to_string(),
            description: posting.description.to_string(),
            reference_id: posting.reference_id.map(str::to_string),
            reference_type: posting.reference_type.map(|r| r.as_str().to_string()),
            operator_id: posting.operator_id,
            created_at: Utc::now(),
        });

        Ok(BalanceChange {
            balance_before,
            balance_after,
        })
    }

    async fn balance(&self, user_id: DbId) -> Result<Credits, LedgerError> {
        let account = self.account(user_id)?;
        let credits = account.lock().await.credits;
        Ok(credits)
    }

    async fn stats(&self, user_id: DbId) -> Result<CreditStats, LedgerError> {
        let account = self.account(user_id)?;
        let account = account.lock().await;
        Ok(CreditStats::new(
            account.credits,
            account.total_earned,
            account.total_spent,
        ))
    }

    async fn history(
        &self,
        user_id: DbId,
        query: &HistoryQuery,
    ) -> Result<TransactionPage, LedgerError> {
        let account = self.account(user_id)?;
        let account = account.lock().await;

        let matching: Vec<&CreditTransaction> = account
            .transactions
            .iter()
            .rev()
            .filter(|t| query.kind.map_or(true, |k| t.transaction_type == k.as_str()))
            .filter(|t| query.start.map_or(true, |s| t.created_at >= s))
            .filter(|t| query.end.map_or(true, |e| t.created_at <= e))
            .collect();

        let total = matching.len() as i64;
        let transactions = matching
            .into_iter()
            .skip(query.offset().max(0) as usize)
            .take(query.page_size.max(0) as usize)
            .cloned()
            .collect();

        Ok(TransactionPage {
            transactions,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total_pages(total, query.page_size),
        })
    }
}
