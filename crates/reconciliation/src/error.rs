use payments::PaymentError;
use thiserror::Error;

/// Errors raised by leases and reconciliation cycles.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// Scanning or driving a transaction failed.
    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<domain::DomainError> for ReconciliationError {
    fn from(err: domain::DomainError) -> Self {
        Self::Payment(err.into())
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconciliationError>;
