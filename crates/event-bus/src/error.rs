use thiserror::Error;

use crate::DeliveryKey;

/// Errors that can occur when storing, relaying or delivering events.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The bus refused or failed to accept an event.
    #[error("Publish failed for {delivery_key}: {reason}")]
    PublishFailed {
        delivery_key: DeliveryKey,
        reason: String,
    },

    /// An outbox entry referenced by id does not exist.
    #[error("Outbox entry not found: {0}")]
    OutboxEntryNotFound(i64),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
