//! Event publication for payment transactions.
//!
//! - [`EventEnvelope`] is the immutable record of one status transition
//! - [`OutboxStore`] exposes events written atomically with the transition
//! - [`OutboxRelay`] moves outbox entries onto an [`EventBus`]
//! - [`DeduplicatingConsumer`] turns at-least-once delivery into
//!   at-most-once side effects using the delivery key

pub mod bus;
pub mod consumer;
pub mod error;
pub mod event;
pub mod outbox;
pub mod postgres;
pub mod relay;

pub use bus::{EventBus, EventStream, InMemoryEventBus};
pub use common::TransactionId;
pub use consumer::{
    ConsumerError, DeadLetter, DeduplicatingConsumer, Delivery, DeliveryLedger, DeliveryRecord,
    DeliveryStatus, EventHandler, HandlerError, InMemoryDeliveryLedger, Redelivery, truncate_error,
};
pub use error::{EventBusError, Result};
pub use event::{DeliveryKey, EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use outbox::{InMemoryOutbox, OutboxEntry, OutboxLog, OutboxStore, publish_backoff};
pub use postgres::{PostgresDeliveryLedger, PostgresOutbox};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
