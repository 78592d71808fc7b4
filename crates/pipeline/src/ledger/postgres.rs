//! PostgreSQL ledger. Per-user serialization comes from the row lock taken
//! by [`CreditRepo::lock_account`] inside each posting's transaction.

use async_trait::async_trait;
use atelier_core::credits::{total_pages, BalanceChange, CreditStats, TransactionKind};
use atelier_core::types::{Credits, DbId};
use atelier_db::models::credit::{NewCreditTransaction, TransactionPage};
use atelier_db::repositories::{CreditRepo, HistoryFilter};
use sqlx::PgPool;

use super::{counter_deltas, next_balance, CreditLedger, HistoryQuery, LedgerError, Posting};

#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn record(&self, posting: Posting<'_>) -> Result<BalanceChange, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let account = CreditRepo::lock_account(&mut tx, posting.user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(posting.user_id))?;

        if posting.kind == TransactionKind::Spend {
            if let Some(reference) = posting.reference_id {
                if CreditRepo::spend_exists(&mut tx, reference).await? {
                    return Err(LedgerError::AlreadyCharged(reference.to_string()));
                }
            }
        }

        let balance_after = next_balance(account.credits, posting.amount)?;
        let (earned, spent) = counter_deltas(posting.amount);
        CreditRepo::apply_balance(&mut tx, posting.user_id, balance_after, earned, spent).await?;

        let entry = NewCreditTransaction {
            user_id: posting.user_id,
            amount: posting.amount,
            balance_before: account.credits,
            balance_after,
            transaction_type: posting.kind.as_str(),
            description: posting.description,
            reference_id: posting.reference_id,
            reference_type: posting.reference_type.map(|r| r.as_str()),
            operator_id: posting.operator_id,
        };
        if let Err(e) = CreditRepo::insert_transaction(&mut tx, &entry).await {
            // Lost a race with a concurrent debit for the same reference.
            if is_unique_violation(&e) && posting.kind == TransactionKind::Spend {
                return Err(LedgerError::AlreadyCharged(
                    posting.reference_id.unwrap_or_default().to_string(),
                ));
            }
            return Err(e.into());
        }

        tx.commit().await?;

        tracing::info!(
            user_id = posting.user_id,
            kind = posting.kind.as_str(),
            amount = posting.amount,
            balance_before = account.credits,
            balance_after,
            reference_id = ?posting.reference_id,
            "Ledger posting committed",
        );

        Ok(BalanceChange {
            balance_before: account.credits,
            balance_after,
        })
    }

    async fn balance(&self, user_id: DbId) -> Result<Credits, LedgerError> {
        let account = CreditRepo::find_account(&self.pool, user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        Ok(account.credits)
    }

    async fn stats(&self, user_id: DbId) -> Result<CreditStats, LedgerError> {
        let account = CreditRepo::find_account(&self.pool, user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
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
        let filter = HistoryFilter {
            transaction_type: query.kind.map(|k| k.as_str()),
            start: query.start,
            end: query.end,
        };
        let transactions = CreditRepo::list_transactions(
            &self.pool,
            user_id,
            filter,
            query.page_size,
            query.offset(),
        )
        .await?;
        let total = CreditRepo::count_transactions(&self.pool, user_id, filter).await?;

        Ok(TransactionPage {
            transactions,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total_pages(total, query.page_size),
        })
    }
}
