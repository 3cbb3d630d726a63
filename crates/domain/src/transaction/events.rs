//! Payment transaction events.

use common::{IdempotencyKey, Money};
use serde::{Deserialize, Serialize};

use super::{FailureReason, RetryStage, TransactionStatus};

/// One applied transition of a payment transaction.
///
/// Every variant carries the transaction's attempt count after the
/// transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransactionEvent {
    /// Transaction was persisted for an idempotency key.
    Created {
        idempotency_key: IdempotencyKey,
        amount: Money,
        attempt_count: u32,
    },

    /// Charge dispatch began.
    AuthorizationStarted { attempt_count: u32 },

    /// Provider accepted the charge.
    Authorized {
        provider_reference: String,
        /// True when the provider settled synchronously.
        settled: bool,
        attempt_count: u32,
    },

    /// Provider declined the charge.
    Declined {
        reason: FailureReason,
        attempt_count: u32,
    },

    /// Settlement confirmation began.
    CaptureStarted { attempt_count: u32 },

    /// Funds captured.
    Captured { attempt_count: u32 },

    /// A transient failure; `stage` will be re-entered.
    RetryScheduled {
        stage: RetryStage,
        reason: FailureReason,
        attempt_count: u32,
    },

    /// Terminal failure.
    Failed {
        reason: FailureReason,
        attempt_count: u32,
    },

    /// Refund of the captured amount began.
    RefundStarted { amount: Money, attempt_count: u32 },

    /// Funds returned.
    Refunded {
        refund_reference: String,
        attempt_count: u32,
    },
}

impl TransactionEvent {
    /// Returns the event type name used on the bus.
    pub fn event_type(&self) -> &'static str {
        match self {
            TransactionEvent::Created { .. } => "PaymentCreated",
            TransactionEvent::AuthorizationStarted { .. } => "PaymentAuthorizationStarted",
            TransactionEvent::Authorized { .. } => "PaymentAuthorized",
            TransactionEvent::Declined { .. } => "PaymentDeclined",
            TransactionEvent::CaptureStarted { .. } => "PaymentCaptureStarted",
            TransactionEvent::Captured { .. } => "PaymentCaptured",
            TransactionEvent::RetryScheduled { .. } => "PaymentRetryScheduled",
            TransactionEvent::Failed { .. } => "PaymentFailed",
            TransactionEvent::RefundStarted { .. } => "PaymentRefundStarted",
            TransactionEvent::Refunded { .. } => "PaymentRefunded",
        }
    }

    /// Returns the status the transition enters.
    pub fn status(&self) -> TransactionStatus {
        match self {
            TransactionEvent::Created { .. } => TransactionStatus::Created,
            TransactionEvent::AuthorizationStarted { .. } => TransactionStatus::Authorizing,
            TransactionEvent::Authorized { .. } => TransactionStatus::Authorized,
            TransactionEvent::Declined { .. } => TransactionStatus::Declined,
            TransactionEvent::CaptureStarted { .. } => TransactionStatus::Capturing,
            TransactionEvent::Captured { .. } => TransactionStatus::Captured,
            TransactionEvent::RetryScheduled { .. } => TransactionStatus::FailedRetryable,
            TransactionEvent::Failed { .. } => TransactionStatus::FailedTerminal,
            TransactionEvent::RefundStarted { .. } => TransactionStatus::Refunding,
            TransactionEvent::Refunded { .. } => TransactionStatus::Refunded,
        }
    }

    /// Returns the attempt count after the transition.
    pub fn attempt_count(&self) -> u32 {
        match self {
            TransactionEvent::Created { attempt_count, .. }
            | TransactionEvent::AuthorizationStarted { attempt_count }
            | TransactionEvent::Authorized { attempt_count, .. }
            | TransactionEvent::Declined { attempt_count, .. }
            | TransactionEvent::CaptureStarted { attempt_count }
            | TransactionEvent::Captured { attempt_count }
            | TransactionEvent::RetryScheduled { attempt_count, .. }
            | TransactionEvent::Failed { attempt_count, .. }
            | TransactionEvent::RefundStarted { attempt_count, .. }
            | TransactionEvent::Refunded { attempt_count, .. } => *attempt_count,
        }
    }

    /// Returns the failure reason carried by the event, if any.
    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            TransactionEvent::Declined { reason, .. }
            | TransactionEvent::RetryScheduled { reason, .. }
            | TransactionEvent::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
