//! Payment transaction aggregate and related types.

mod aggregate;
mod events;
pub mod reason;
mod status;

pub use aggregate::{PaymentTransaction, Transition};
pub use events::TransactionEvent;
pub use reason::FailureReason;
pub use status::{RetryStage, TransactionStatus, UnknownStatus};

use common::Money;
use thiserror::Error;

/// A transition the lifecycle rules do not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The move between the two statuses is not part of the lifecycle.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// The provider reference was already set to a different value.
    #[error("Provider reference is immutable (already {existing})")]
    ProviderReferenceImmutable { existing: String },

    /// Transactions can only be created for positive amounts.
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Money),
}
