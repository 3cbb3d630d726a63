//! Payment transaction domain.
//!
//! This crate provides:
//! - [`PaymentTransaction`] and its lifecycle rules
//! - [`TransactionStore`] with in-memory and PostgreSQL implementations,
//!   writing state, audit trail and outbox atomically
//! - [`IdempotencyStore`] with in-memory and PostgreSQL implementations

pub mod audit;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod transaction;

pub use audit::AuditRecord;
pub use error::{DomainError, Result};
pub use idempotency::{
    DEFAULT_RETENTION_HOURS, IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore,
    OutcomeSnapshot, Reservation, derive_key, fingerprint,
};
pub use memory::InMemoryTransactionStore;
pub use postgres::{PostgresIdempotencyStore, PostgresTransactionStore};
pub use store::{TransactionStore, TransitionPayload, TransitionRecord};
pub use transaction::{
    FailureReason, PaymentTransaction, RetryStage, TransactionEvent, TransactionStatus,
    Transition, TransitionError, reason,
};
