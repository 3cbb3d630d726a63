//! Payment error types.

use common::{IdempotencyKey, TransactionId};
use domain::{DomainError, TransactionStatus, TransitionError};
use thiserror::Error;

/// Errors returned to callers of the engine and the orchestrator.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The request failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The key is live for a request with different content.
    #[error("Idempotency key {key} was already used for a different request")]
    IdempotencyConflict { key: IdempotencyKey },

    /// The provider's circuit is open; the caller should try later.
    #[error("Payment provider unavailable for transaction {transaction_id}, try again later")]
    CircuitOpen { transaction_id: TransactionId },

    /// No transaction with this id.
    #[error("Transaction not found: {0}")]
    NotFound(TransactionId),

    /// The operation does not apply to the transaction's current status.
    #[error("Cannot {operation} transaction {transaction_id} in status {status}")]
    InvalidState {
        transaction_id: TransactionId,
        status: TransactionStatus,
        operation: &'static str,
    },

    #[error("Domain error: {0}")]
    Domain(#[source] DomainError),
}

impl From<DomainError> for PaymentError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::IdempotencyConflict { key } => PaymentError::IdempotencyConflict { key },
            DomainError::TransactionNotFound(id) => PaymentError::NotFound(id),
            DomainError::Validation(e) => PaymentError::InvalidRequest(e.to_string()),
            DomainError::Transition(TransitionError::NonPositiveAmount(amount)) => {
                PaymentError::InvalidRequest(format!("amount must be positive, got {amount}"))
            }
            other => PaymentError::Domain(other),
        }
    }
}

impl From<TransitionError> for PaymentError {
    fn from(e: TransitionError) -> Self {
        DomainError::from(e).into()
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
