//! Audit trail rows.

use chrono::{DateTime, Utc};
use common::TransactionId;
use event_bus::Version;
use serde::{Deserialize, Serialize};

use crate::transaction::{PaymentTransaction, TransactionStatus, Transition};

/// One row of a transaction's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub transaction_id: TransactionId,
    /// Version reached by the transition.
    pub version: Version,
    pub from: Option<TransactionStatus>,
    pub to: TransactionStatus,
    pub event_type: String,
    /// Failure reason code, if the transition carried one.
    pub reason: Option<String>,
    pub attempt_count: u32,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Builds the audit row for a transition just applied to `transaction`.
    pub fn for_transition(transaction: &PaymentTransaction, transition: &Transition) -> Self {
        Self {
            transaction_id: transaction.id(),
            version: transaction.version(),
            from: transition.from,
            to: transition.event.status(),
            event_type: transition.event.event_type().to_string(),
            reason: transition.event.reason().map(|r| r.code.clone()),
            attempt_count: transition.event.attempt_count(),
            recorded_at: transition.at,
        }
    }
}
