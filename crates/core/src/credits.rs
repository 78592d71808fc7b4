//! Credit ledger vocabulary: transaction kinds, reference types, amount
//! rules and the value types returned by ledger operations.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Credits;

/// Credits granted when an account is created.
pub const REGISTRATION_BONUS: Credits = 500;

pub const DEFAULT_HISTORY_PAGE_SIZE: i64 = 20;
pub const MAX_HISTORY_PAGE_SIZE: i64 = 100;

// ---------------------------------------------------------------------------
// Transaction kind
// ---------------------------------------------------------------------------

/// What a ledger entry did to the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Earn,
    Spend,
    Refund,
    AdminAdjust,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Earn => "earn",
            TransactionKind::Spend => "spend",
            TransactionKind::Refund => "refund",
            TransactionKind::AdminAdjust => "admin_adjust",
        }
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "earn" => Ok(TransactionKind::Earn),
            "spend" => Ok(TransactionKind::Spend),
            "refund" => Ok(TransactionKind::Refund),
            "admin_adjust" => Ok(TransactionKind::AdminAdjust),
            other => Err(CoreError::Validation(format!(
                "Unknown transaction type '{other}'. Must be one of: earn, spend, refund, admin_adjust"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference type
// ---------------------------------------------------------------------------

/// What caused a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    ImageGeneration,
    ImageGenerationMock,
    Registration,
    Admin,
    Refund,
}

impl ReferenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceType::ImageGeneration => "image_generation",
            ReferenceType::ImageGenerationMock => "image_generation_mock",
            ReferenceType::Registration => "registration",
            ReferenceType::Admin => "admin",
            ReferenceType::Refund => "refund",
        }
    }
}

impl TryFrom<&str> for ReferenceType {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "image_generation" => Ok(ReferenceType::ImageGeneration),
            "image_generation_mock" => Ok(ReferenceType::ImageGenerationMock),
            "registration" => Ok(ReferenceType::Registration),
            "admin" => Ok(ReferenceType::Admin),
            "refund" => Ok(ReferenceType::Refund),
            other => Err(CoreError::Validation(format!(
                "Unknown reference type '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Balance on both sides of a committed ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub balance_before: Credits,
    pub balance_after: Credits,
}

/// Aggregate view of a user's account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditStats {
    pub current_credits: Credits,
    pub total_earned: Credits,
    pub total_spent: Credits,
    pub net_credits: Credits,
}

impl CreditStats {
    pub fn new(current_credits: Credits, total_earned: Credits, total_spent: Credits) -> Self {
        Self {
            current_credits,
            total_earned,
            total_spent,
            net_credits: total_earned - total_spent,
        }
    }
}

/// Ledger amounts carry no sign; the operation decides the direction.
pub fn validate_amount(amount: Credits) -> Result<(), CoreError> {
    if amount <= 0 {
        return Err(CoreError::Validation(format!(
            "Credit amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

/// Clamp a requested history page size into `1..=MAX_HISTORY_PAGE_SIZE`.
pub fn clamp_page_size(page_size: Option<i64>) -> i64 {
    page_size
        .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE)
        .clamp(1, MAX_HISTORY_PAGE_SIZE)
}

/// Pages are 1-based.
pub fn clamp_page(page: Option<i64>) -> i64 {
    page.unwrap_or(1).max(1)
}

pub fn total_pages(total: i64, page_size: i64) -> i64 {
    if page_size <= 0 {
        return 0;
    }
    (total + page_size - 1) / page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            TransactionKind::Earn,
            TransactionKind::Spend,
            TransactionKind::Refund,
            TransactionKind::AdminAdjust,
        ] {
            assert_eq!(TransactionKind::try_from(kind.as_str()).unwrap(), kind);
        }
        assert!(TransactionKind::try_from("gift").is_err());
    }

    #[test]
    fn reference_type_parses_known_values() {
        assert_eq!(
            ReferenceType::try_from("image_generation_mock").unwrap(),
            ReferenceType::ImageGenerationMock
        );
        assert!(ReferenceType::try_from("likes").is_err());
    }

    #[test]
    fn zero_and_negative_amounts_rejected() {
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(-15).is_err());
        assert!(validate_amount(1).is_ok());
    }

    #[test]
    fn stats_net_is_earned_minus_spent() {
        let stats = CreditStats::new(470, 500, 30);
        assert_eq!(stats.net_credits, 470);
    }

    #[test]
    fn paging_helpers_clamp() {
        assert_eq!(clamp_page_size(None), 20);
        assert_eq!(clamp_page_size(Some(1000)), 100);
        assert_eq!(clamp_page_size(Some(0)), 1);
        assert_eq!(clamp_page(Some(-3)), 1);
        assert_eq!(total_pages(41, 20), 3);
        assert_eq!(total_pages(0, 20), 0);
    }
}
