//! Repository for user balances and the `credit_transactions` ledger.
//!
//! The write helpers take a `&mut PgConnection` so the caller can run
//! lock, balance update and ledger insert inside one transaction. Ledger
//! rows have no update or delete path.

use atelier_core::types::{Credits, DbId, Timestamp};
use sqlx::{PgConnection, PgPool};

use crate::models::credit::{CreditAccount, CreditTransaction, NewCreditTransaction};

/// Column list for `credit_transactions` queries.
const COLUMNS: &str = "\
    id, user_id, amount, balance_before, balance_after, transaction_type, \
    description, reference_id, reference_type, operator_id, created_at";

/// Column list for the balance view of `users`.
const ACCOUNT_COLUMNS: &str = "id, credits, total_earned, total_spent";

/// Filters shared by the history list and count queries.
///
/// `$1` user, `$2` type, `$3` start, `$4` end.
const HISTORY_FILTER: &str = "\
    user_id = $1 \
    AND ($2::TEXT IS NULL OR transaction_type = $2) \
    AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3) \
    AND ($4::TIMESTAMPTZ IS NULL OR created_at <= $4)";

/// Filters for ledger history listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryFilter<'a> {
    pub transaction_type: Option<&'a str>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

pub struct CreditRepo;

impl CreditRepo {
    /// Read a user's balance columns without locking.
    pub async fn find_account(
        pool: &PgPool,
        user_id: DbId,
    ) -> Result<Option<CreditAccount>, sqlx::Error> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1");
        sqlx::query_as::<_, CreditAccount>(&query)
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }

    /// Read a user's balance columns holding the row lock until the
    /// surrounding transaction ends.
    pub async fn lock_account(
        conn: &mut PgConnection,
        user_id: DbId,
    ) -> Result<Option<CreditAccount>, sqlx::Error> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, CreditAccount>(&query)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
    }

    /// Write the new balance and bump the cumulative counters.
    pub async fn apply_balance(
        conn: &mut PgConnection,
        user_id: DbId,
        credits: Credits,
        earned_delta: Credits,
        spent_delta: Credits,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users \
             SET credits = $2, \
                 total_earned = total_earned + $3, \
                 total_spent = total_spent + $4, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(credits)
        .bind(earned_delta)
        .bind(spent_delta)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Append a ledger entry.
    pub async fn insert_transaction(
        conn: &mut PgConnection,
        entry: &NewCreditTransaction<'_>,
    ) -> Result<CreditTransaction, sqlx::Error> {
        let query = format!(
            "INSERT INTO credit_transactions \
                 (user_id, amount, balance_before, balance_after, transaction_type, \
                  description, reference_id, reference_type, operator_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, CreditTransaction>(&query)
            .bind(entry.user_id)
            .bind(entry.amount)
            .bind(entry.balance_before)
            .bind(entry.balance_after)
            .bind(entry.transaction_type)
            .bind(entry.description)
            .bind(entry.reference_id)
            .bind(entry.reference_type)
            .bind(entry.operator_id)
            .fetch_one(&mut *conn)
            .await
    }

    /// Whether a debit already exists for this reference.
    pub async fn spend_exists(
        conn: &mut PgConnection,
        reference_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM credit_transactions \
                 WHERE transaction_type = 'spend' AND reference_id = $1 \
             )",
        )
        .bind(reference_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }

    /// Ledger rows for a user, newest first.
    pub async fn list_transactions(
        pool: &PgPool,
        user_id: DbId,
        filter: HistoryFilter<'_>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM credit_transactions \
             WHERE {HISTORY_FILTER} \
             ORDER BY created_at DESC, id DESC \
             LIMIT $5 OFFSET $6"
        );
        sqlx::query_as::<_, CreditTransaction>(&query)
            .bind(user_id)
            .bind(filter.transaction_type)
            .bind(filter.start)
            .bind(filter.end)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Total rows matching the same filters as [`Self::list_transactions`].
    pub async fn count_transactions(
        pool: &PgPool,
        user_id: DbId,
        filter: HistoryFilter<'_>,
    ) -> Result<i64, sqlx::Error> {
        let query = format!("SELECT COUNT(*) FROM credit_transactions WHERE {HISTORY_FILTER}");
        sqlx::query_scalar(&query)
            .bind(user_id)
            .bind(filter.transaction_type)
            .bind(filter.start)
            .bind(filter.end)
            .fetch_one(pool)
            .await
    }
}
