//! Payment transaction orchestration.
//!
//! [`TransactionStateMachine`] advances one transaction through its
//! lifecycle, one persisted transition at a time, calling the provider
//! through a [`gateway::ResilientGateway`]. [`Orchestrator`] is the request
//! path: it deduplicates submissions by idempotency key, starts the engine
//! on the runtime and waits for an outcome.

pub mod error;
pub mod locks;
pub mod machine;
pub mod orchestrator;

pub use error::{PaymentError, Result};
pub use locks::{TransactionGuard, TransactionLocks};
pub use machine::{StateMachineConfig, StepOutcome, TransactionStateMachine, failure_reason};
pub use orchestrator::{Orchestrator, OrchestratorConfig, PaymentOutcome, PaymentRequest, SubmitMode};
