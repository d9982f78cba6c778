//! Billing error taxonomy.
//!
//! NotFound/Validation/SignatureInvalid surface to callers with specific
//! HTTP codes. Processor errors on user-initiated paths surface without any
//! local state committed; during sweeps they are caught per record. Storage
//! failure while writing webhook idempotency bookkeeping is the one case the
//! webhook endpoint answers with a 500.

use thiserror::Error;

use crate::processor::ProcessorError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Subscription plan not found: {0}")]
    PlanNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Billing account not found: {0}")]
    BillingAccountNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Payment processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Storage(err.to_string())
    }
}

impl BillingError {
    /// Machine-readable code used by the HTTP layer and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            BillingError::UserNotFound(_) => "USER_NOT_FOUND",
            BillingError::BillingAccountNotFound(_) => "BILLING_ACCOUNT_NOT_FOUND",
            BillingError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::Processor(_) => "SUBSCRIPTION_ERROR",
            BillingError::SignatureInvalid => "INVALID_SIGNATURE",
            BillingError::Storage(_) => "STORAGE_ERROR",
            BillingError::ConcurrentModification(_) => "CONFLICT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            BillingError::PlanNotFound("premium_individual".into()).code(),
            "PLAN_NOT_FOUND"
        );
        assert_eq!(BillingError::SignatureInvalid.code(), "INVALID_SIGNATURE");
        assert_eq!(
            BillingError::Processor(ProcessorError::Api("boom".into())).code(),
            "SUBSCRIPTION_ERROR"
        );
    }
}
