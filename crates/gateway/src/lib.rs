//! Outbound payment provider access.
//!
//! - [`PaymentGateway`] is the provider contract (charge, settlement status,
//!   refund)
//! - [`GatewayError`] and [`classify_provider_code`] decide what is safe to
//!   retry
//! - [`ResilientGateway`] adds a per-endpoint [`CircuitBreaker`], per-call
//!   timeouts and a [`RetryPolicy`]
//! - [`SimulatedGateway`] is a scriptable in-process provider

pub mod circuit;
pub mod client;
pub mod error;
pub mod resilient;
pub mod retry;
pub mod simulated;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use client::{
    ChargeOutcome, ChargeRequest, PaymentGateway, RefundReceipt, RefundRequest, SettlementStatus,
};
pub use error::{ErrorClass, GatewayError, Result, classify_provider_code};
pub use resilient::{Attempted, ResilienceConfig, ResilientGateway};
pub use retry::RetryPolicy;
pub use simulated::SimulatedGateway;
