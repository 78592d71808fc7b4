//! Credit ledger: per-user serialized balance changes with an append-only
//! transaction record.
//!
//! Implementations provide [`CreditLedger::record`] (one atomic posting)
//! and the read side; the named operations (`spend`, `earn`, `refund`,
//! `admin_adjust`, `grant_initial`) are built on top of it here so both
//! adapters share their validation.

mod memory;
mod postgres;

pub use memory::MemoryCreditLedger;
pub use postgres::PgCreditLedger;

use async_trait::async_trait;
use atelier_core::credits::{
    clamp_page, clamp_page_size, validate_amount, BalanceChange, CreditStats, ReferenceType,
    TransactionKind, REGISTRATION_BONUS,
};
use atelier_core::error::CoreError;
use atelier_core::types::{Credits, DbId, Timestamp};
use atelier_db::models::credit::{TransactionHistoryQuery, TransactionPage};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: Credits, required: Credits },

    #[error("Credit account {0} not found")]
    AccountNotFound(DbId),

    #[error("Reference {0} has already been charged")]
    AlreadyCharged(String),

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<LedgerError> for CoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount(msg) => CoreError::Validation(msg),
            LedgerError::InsufficientCredits { balance, required } => {
                CoreError::InsufficientCredits { balance, required }
            }
            LedgerError::AccountNotFound(id) => CoreError::NotFound {
                entity: "CreditAccount",
                id: id.to_string(),
            },
            LedgerError::AlreadyCharged(reference) => {
                CoreError::Conflict(format!("Reference {reference} has already been charged"))
            }
            LedgerError::Storage(msg) => CoreError::Internal(msg),
        }
    }
}

/// One balance change as a single atomic unit. `amount` is signed.
#[derive(Debug, Clone)]
pub struct Posting<'a> {
    pub user_id: DbId,
    pub kind: TransactionKind,
    pub amount: Credits,
    pub description: &'a str,
    pub reference_id: Option<&'a str>,
    pub reference_type: Option<ReferenceType>,
    pub operator_id: Option<DbId>,
}

/// History filters and paging, already clamped.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub page: i64,
    pub page_size: i64,
    pub kind: Option<TransactionKind>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl HistoryQuery {
    /// Clamp paging and parse the kind filter from raw query parameters.
    pub fn from_params(params: &TransactionHistoryQuery) -> Result<Self, CoreError> {
        let kind = params
            .transaction_type
            .as_deref()
            .map(TransactionKind::try_from)
            .transpose()?;
        Ok(Self {
            page: clamp_page(params.page),
            page_size: clamp_page_size(params.page_size),
            kind,
            start: params.start_date,
            end: params.end_date,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Apply one posting: lock the account, check the resulting balance,
    /// update the counters and append the transaction row, or change
    /// nothing.
    ///
    /// A `Spend` against a reference that already has a spend fails with
    /// [`LedgerError::AlreadyCharged`].
    async fn record(&self, posting: Posting<'_>) -> Result<BalanceChange, LedgerError>;

    async fn balance(&self, user_id: DbId) -> Result<Credits, LedgerError>;

    async fn stats(&self, user_id: DbId) -> Result<CreditStats, LedgerError>;

    async fn history(
        &self,
        user_id: DbId,
        query: &HistoryQuery,
    ) -> Result<TransactionPage, LedgerError>;

    async fn spend(
        &self,
        user_id: DbId,
        amount: Credits,
        description: &str,
        reference_id: Option<&str>,
        reference_type: ReferenceType,
    ) -> Result<BalanceChange, LedgerError> {
        validate_amount(amount).map_err(|e| LedgerError::InvalidAmount(e.to_string()))?;
        self.record(Posting {
            user_id,
            kind: TransactionKind::Spend,
            amount: -amount,
            description,
            reference_id,
            reference_type: Some(reference_type),
            operator_id: None,
        })
        .await
    }

    async fn earn(
        &self,
        user_id: DbId,
        amount: Credits,
        description: &str,
        reference_id: Option<&str>,
        reference_type: ReferenceType,
    ) -> Result<BalanceChange, LedgerError> {
        validate_amount(amount).map_err(|e| LedgerError::InvalidAmount(e.to_string()))?;
        self.record(Posting {
            user_id,
            kind: TransactionKind::Earn,
            amount,
            description,
            reference_id,
            reference_type: Some(reference_type),
            operator_id: None,
        })
        .await
    }

    async fn refund(
        &self,
        user_id: DbId,
        amount: Credits,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<BalanceChange, LedgerError> {
        validate_amount(amount).map_err(|e| LedgerError::InvalidAmount(e.to_string()))?;
        self.record(Posting {
            user_id,
            kind: TransactionKind::Refund,
            amount,
            description,
            reference_id,
            reference_type: Some(ReferenceType::Refund),
            operator_id: None,
        })
        .await
    }

    /// Signed manual correction by an operator.
    async fn admin_adjust(
        &self,
        user_id: DbId,
        amount: Credits,
        description: &str,
        operator_id: DbId,
    ) -> Result<BalanceChange, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(
                "Adjustment amount must not be zero".into(),
            ));
        }
        self.record(Posting {
            user_id,
            kind: TransactionKind::AdminAdjust,
            amount,
            description,
            reference_id: None,
            reference_type: Some(ReferenceType::Admin),
            operator_id: Some(operator_id),
        })
        .await
    }

    /// Registration bonus for a new account.
    async fn grant_initial(&self, user_id: DbId) -> Result<BalanceChange, LedgerError> {
        let reference = format!("user_{user_id}");
        self.earn(
            user_id,
            REGISTRATION_BONUS,
            "New user registration bonus",
            Some(&reference),
            ReferenceType::Registration,
        )
        .await
    }
}

/// Counter deltas for a signed amount: `(earned, spent)`.
pub(crate) fn counter_deltas(amount: Credits) -> (Credits, Credits) {
    if amount >= 0 {
        (amount, 0)
    } else {
        (0, -amount)
    }
}

/// The balance a posting would leave, or why it cannot be applied.
pub(crate) fn next_balance(current: Credits, amount: Credits) -> Result<Credits, LedgerError> {
    let next = current + amount;
    if next < 0 {
        return Err(LedgerError::InsufficientCredits {
            balance: current,
            required: -amount,
        });
    }
    Ok(next)
}
