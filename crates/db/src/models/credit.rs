//! Credit account and ledger entry models.

use atelier_core::types::{Credits, DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Balance columns of a `users` row.
#[derive(Debug, Clone, Copy, FromRow, Serialize)]
pub struct CreditAccount {
    pub id: DbId,
    pub credits: Credits,
    pub total_earned: Credits,
    pub total_spent: Credits,
}

/// A row from the `credit_transactions` table. Never updated.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CreditTransaction {
    pub id: DbId,
    pub user_id: DbId,
    pub amount: Credits,
    pub balance_before: Credits,
    pub balance_after: Credits,
    pub transaction_type: String,
    pub description: String,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub operator_id: Option<DbId>,
    pub created_at: Timestamp,
}

/// Insert payload for a ledger entry; `amount` is already signed.
#[derive(Debug, Clone)]
pub struct NewCreditTransaction<'a> {
    pub user_id: DbId,
    pub amount: Credits,
    pub balance_before: Credits,
    pub balance_after: Credits,
    pub transaction_type: &'a str,
    pub description: &'a str,
    pub reference_id: Option<&'a str>,
    pub reference_type: Option<&'a str>,
    pub operator_id: Option<DbId>,
}

/// Query parameters for `GET /api/v1/credits/transactions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryQuery {
    /// 1-based page number. Defaults to 1.
    pub page: Option<i64>,
    /// Defaults to 20, capped at 100.
    pub page_size: Option<i64>,
    /// Filter by transaction kind (`earn`, `spend`, ...).
    #[serde(rename = "type")]
    pub transaction_type: Option<String>,
    pub start_date: Option<Timestamp>,
    pub end_date: Option<Timestamp>,
}

/// One page of ledger history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub transactions: Vec<CreditTransaction>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}
