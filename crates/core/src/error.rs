use crate::types::Credits;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: Credits, required: Credits },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// How many credits the caller is missing, for `InsufficientCredits`.
    pub fn shortfall(&self) -> Option<Credits> {
        match self {
            CoreError::InsufficientCredits { balance, required } => {
                Some((required - balance).max(0))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_is_difference_for_insufficient_credits() {
        let err = CoreError::InsufficientCredits {
            balance: 10,
            required: 30,
        };
        assert_eq!(err.shortfall(), Some(20));
    }

    #[test]
    fn shortfall_is_none_for_other_variants() {
        assert_eq!(CoreError::Validation("x".into()).shortfall(), None);
    }
}
