//! Payment transaction lifecycle.

use serde::{Deserialize, Serialize};

/// The status of a payment transaction.
///
/// State transitions:
/// ```text
/// Created ──► Authorizing ──► Authorized ──► Capturing ──► Captured ──► Refunding ──► Refunded
///                 │  ▲                          │  ▲
///                 │  └────── FailedRetryable ◄──┘  │
///                 │          │        └────────────┘
///                 ▼          ▼
///             Declined   FailedTerminal ◄── (Authorizing | Capturing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Persisted, no provider contact yet.
    #[default]
    Created,

    /// A charge is being dispatched to the provider.
    Authorizing,

    /// The provider accepted the charge.
    Authorized,

    /// Settlement of an accepted charge is being confirmed.
    Capturing,

    /// Funds captured (terminal success).
    Captured,

    /// The provider declined the charge (terminal).
    Declined,

    /// A transient failure; the failed stage will be re-entered.
    FailedRetryable,

    /// Attempts exhausted or a non-retryable error (terminal).
    FailedTerminal,

    /// A refund of a captured charge is in progress.
    Refunding,

    /// Funds returned (terminal).
    Refunded,
}

impl TransactionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TransactionStatus; 10] = [
        TransactionStatus::Created,
        TransactionStatus::Authorizing,
        TransactionStatus::Authorized,
        TransactionStatus::Capturing,
        TransactionStatus::Captured,
        TransactionStatus::Declined,
        TransactionStatus::FailedRetryable,
        TransactionStatus::FailedTerminal,
        TransactionStatus::Refunding,
        TransactionStatus::Refunded,
    ];

    /// Returns true if the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;

        matches!(
            (self, next),
            (Created, Authorizing)
                | (Authorizing, Authorized | Declined | FailedRetryable | FailedTerminal)
                | (Authorized, Capturing)
                | (Capturing, Captured | FailedRetryable | FailedTerminal)
                | (FailedRetryable, Authorizing | Capturing | FailedTerminal)
                | (Captured, Refunding)
                | (Refunding, Refunded)
        )
    }

    /// Returns true if no automatic transition leaves this status.
    ///
    /// `Captured` counts as terminal: only an explicit refund request moves it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Captured
                | TransactionStatus::Declined
                | TransactionStatus::FailedTerminal
                | TransactionStatus::Refunded
        )
    }

    /// Returns true for terminal failures that must not be retried as-is.
    pub fn is_definite_failure(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Declined | TransactionStatus::FailedTerminal
        )
    }

    /// Returns the status name in SCREAMING_SNAKE_CASE, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "CREATED",
            TransactionStatus::Authorizing => "AUTHORIZING",
            TransactionStatus::Authorized => "AUTHORIZED",
            TransactionStatus::Capturing => "CAPTURING",
            TransactionStatus::Captured => "CAPTURED",
            TransactionStatus::Declined => "DECLINED",
            TransactionStatus::FailedRetryable => "FAILED_RETRYABLE",
            TransactionStatus::FailedTerminal => "FAILED_TERMINAL",
            TransactionStatus::Refunding => "REFUNDING",
            TransactionStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A status string that names no [`TransactionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown transaction status: {0}")]
pub struct UnknownStatus(pub String);

/// The stage a [`TransactionStatus::FailedRetryable`] transaction re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStage {
    Authorizing,
    Capturing,
}

impl RetryStage {
    /// The status entered when the stage is retried.
    pub fn status(&self) -> TransactionStatus {
        match self {
            RetryStage::Authorizing => TransactionStatus::Authorizing,
            RetryStage::Capturing => TransactionStatus::Capturing,
        }
    }
}
