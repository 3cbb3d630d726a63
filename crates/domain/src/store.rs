//! Transaction store trait and the record written with each transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, TransactionId};
use event_bus::{EventEnvelope, Version};
use serde::{Deserialize, Serialize};

use crate::audit::AuditRecord;
use crate::transaction::{
    FailureReason, PaymentTransaction, TransactionEvent, TransactionStatus, Transition,
};
use crate::{DomainError, Result};

/// Event payload published for every transition: the transaction as it
/// stands after the transition, plus the event itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPayload {
    pub transaction_id: TransactionId,
    pub idempotency_key: String,
    pub status: TransactionStatus,
    pub amount: Money,
    pub provider_reference: Option<String>,
    pub attempt_count: u32,
    pub reason: Option<FailureReason>,
    pub business_payload: serde_json::Value,
    pub event: TransactionEvent,
}

/// Everything persisted alongside one transition, atomically with the new
/// transaction state.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub audit: AuditRecord,
    pub envelope: EventEnvelope,
}

impl TransitionRecord {
    /// Builds the audit row and outbox envelope for a transition just
    /// applied to `transaction`.
    pub fn new(transaction: &PaymentTransaction, transition: &Transition) -> Result<Self> {
        let status = transition.event.status();
        let payload = TransitionPayload {
            transaction_id: transaction.id(),
            idempotency_key: transaction.idempotency_key().to_string(),
            status,
            amount: transaction.amount(),
            provider_reference: transaction.provider_reference().map(str::to_string),
            attempt_count: transaction.attempt_count(),
            reason: transition.event.reason().cloned(),
            business_payload: transaction.business_payload().clone(),
            event: transition.event.clone(),
        };

        let envelope = EventEnvelope::builder()
            .event_type(transition.event.event_type())
            .transaction_id(transaction.id())
            .version(transaction.version())
            .status(status.as_str())
            .occurred_at(transition.at)
            .payload(&payload)?
            .try_build()
            .ok_or(DomainError::IncompleteEnvelope(transaction.id()))?;

        Ok(Self {
            audit: AuditRecord::for_transition(transaction, transition),
            envelope,
        })
    }
}

/// Durable storage for payment transactions.
///
/// Every write stores the transaction row, its audit row and its outbox
/// entry atomically.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a newly created transaction.
    ///
    /// Fails with [`DomainError::DuplicateTransaction`] if the id exists.
    async fn create(&self, transaction: &PaymentTransaction, record: TransitionRecord)
    -> Result<()>;

    /// Persists a transition if the stored version still equals `expected`.
    ///
    /// Fails with [`DomainError::ConcurrencyConflict`] otherwise.
    async fn commit(
        &self,
        transaction: &PaymentTransaction,
        expected: Version,
        record: TransitionRecord,
    ) -> Result<()>;

    /// Loads a transaction by id.
    async fn get(&self, id: TransactionId) -> Result<Option<PaymentTransaction>>;

    /// Returns transactions still needing work (non-terminal, including
    /// refunds in progress) last updated before `updated_before`, oldest
    /// first.
    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>>;

    /// Returns a transaction's audit trail in version order.
    async fn audit_trail(&self, id: TransactionId) -> Result<Vec<AuditRecord>>;
}
