//! Domain error types.

use common::{IdempotencyKey, TransactionId, ValidationError};
use event_bus::{EventBusError, Version};
use thiserror::Error;

use crate::transaction::{TransitionError, UnknownStatus};

/// Errors that can occur when persisting or loading payment state.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The lifecycle rejected a transition.
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    /// A transaction with this id already exists.
    #[error("Transaction already exists: {0}")]
    DuplicateTransaction(TransactionId),

    /// The stored version moved on since the transaction was loaded.
    #[error(
        "Concurrency conflict for transaction {transaction_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        transaction_id: TransactionId,
        expected: Version,
        actual: Version,
    },

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// The idempotency key is live for a request with different content.
    #[error("Idempotency conflict for key {key}")]
    IdempotencyConflict { key: IdempotencyKey },

    /// A key or currency failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No idempotency record exists for the key.
    #[error("Idempotency record not found: {0}")]
    IdempotencyRecordNotFound(IdempotencyKey),

    /// An outbox envelope was missing a required field.
    #[error("Incomplete event envelope for transaction {0}")]
    IncompleteEnvelope(TransactionId),

    /// A stored status string could not be parsed.
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),

    /// Outbox or bus error.
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
