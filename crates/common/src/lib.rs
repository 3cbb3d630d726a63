//! Shared types used across the payment orchestration crates.

pub mod money;
pub mod types;

pub use money::{Currency, Money};
pub use types::{IdempotencyKey, TransactionId, ValidationError};
