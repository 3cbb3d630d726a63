//! Payment transaction aggregate.

use chrono::{DateTime, Utc};
use common::{IdempotencyKey, Money, TransactionId};
use event_bus::Version;
use serde::{Deserialize, Serialize};

use super::{FailureReason, RetryStage, TransactionEvent, TransactionStatus, TransitionError};

/// An applied transition, ready to be persisted with its audit row and
/// outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Status before the transition; `None` for creation.
    pub from: Option<TransactionStatus>,
    pub event: TransactionEvent,
    pub at: DateTime<Utc>,
}

/// A single payment transaction.
///
/// State changes only through the `start_*`/`record_*` methods, each of
/// which validates the move against the lifecycle, applies the resulting
/// event, and returns it as a [`Transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    id: TransactionId,
    idempotency_key: IdempotencyKey,
    amount: Money,
    status: TransactionStatus,

    /// Stage re-entered after a retryable failure.
    retry_stage: Option<RetryStage>,

    provider_reference: Option<String>,

    /// Provider settled the charge when accepting it.
    #[serde(default)]
    settled: bool,

    refund_reference: Option<String>,

    /// Provider calls made on behalf of this transaction.
    attempt_count: u32,

    last_error: Option<FailureReason>,

    business_payload: serde_json::Value,

    /// Hash of the request that created this transaction.
    fingerprint: String,

    /// Transition sequence number, also the optimistic concurrency token.
    version: Version,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

// Query methods
impl PaymentTransaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn retry_stage(&self) -> Option<RetryStage> {
        self.retry_stage
    }

    pub fn provider_reference(&self) -> Option<&str> {
        self.provider_reference.as_deref()
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn refund_reference(&self) -> Option<&str> {
        self.refund_reference.as_deref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Attempts left before `max_attempts` is reached.
    pub fn remaining_attempts(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempt_count)
    }

    pub fn last_error(&self) -> Option<&FailureReason> {
        self.last_error.as_ref()
    }

    pub fn business_payload(&self) -> &serde_json::Value {
        &self.business_payload
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns true if no automatic transition leaves the current status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// Command methods (apply and return the transition)
impl PaymentTransaction {
    /// Creates a transaction in `Created`, at version 1.
    pub fn create(
        id: TransactionId,
        idempotency_key: IdempotencyKey,
        amount: Money,
        business_payload: serde_json::Value,
        fingerprint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(Self, Transition), TransitionError> {
        if !amount.is_positive() {
            return Err(TransitionError::NonPositiveAmount(amount));
        }

        let mut transaction = Self {
            id,
            idempotency_key: idempotency_key.clone(),
            amount,
            status: TransactionStatus::Created,
            retry_stage: None,
            provider_reference: None,
            settled: false,
            refund_reference: None,
            attempt_count: 0,
            last_error: None,
            business_payload,
            fingerprint: fingerprint.into(),
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        };

        let event = TransactionEvent::Created {
            idempotency_key,
            amount,
            attempt_count: 0,
        };
        transaction.apply(&event, now);

        Ok((
            transaction,
            Transition {
                from: None,
                event,
                at: now,
            },
        ))
    }

    /// Enters `Authorizing`, from `Created` or a retry of the authorization
    /// stage.
    pub fn start_authorization(&mut self, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::AuthorizationStarted {
            attempt_count: self.attempt_count,
        };
        self.transition(event, now)
    }

    /// Records the provider's acceptance of the charge.
    pub fn record_authorized(
        &mut self,
        provider_reference: impl Into<String>,
        settled: bool,
        attempts_used: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let provider_reference = provider_reference.into();
        if let Some(existing) = &self.provider_reference
            && *existing != provider_reference
        {
            return Err(TransitionError::ProviderReferenceImmutable {
                existing: existing.clone(),
            });
        }

        let event = TransactionEvent::Authorized {
            provider_reference,
            settled,
            attempt_count: self.attempt_count + attempts_used,
        };
        self.transition(event, now)
    }

    /// Records an explicit decline.
    pub fn record_declined(
        &mut self,
        reason: FailureReason,
        attempts_used: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::Declined {
            reason,
            attempt_count: self.attempt_count + attempts_used,
        };
        self.transition(event, now)
    }

    /// Enters `Capturing`, from `Authorized` or a retry of the capture stage.
    pub fn start_capture(&mut self, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::CaptureStarted {
            attempt_count: self.attempt_count,
        };
        self.transition(event, now)
    }

    /// Records confirmed settlement.
    pub fn record_captured(
        &mut self,
        attempts_used: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::Captured {
            attempt_count: self.attempt_count + attempts_used,
        };
        self.transition(event, now)
    }

    /// Records a transient failure of the current stage.
    pub fn record_retryable_failure(
        &mut self,
        reason: FailureReason,
        attempts_used: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let stage = match self.status {
            TransactionStatus::Authorizing => RetryStage::Authorizing,
            TransactionStatus::Capturing => RetryStage::Capturing,
            from => {
                return Err(TransitionError::InvalidTransition {
                    from,
                    to: TransactionStatus::FailedRetryable,
                });
            }
        };

        let event = TransactionEvent::RetryScheduled {
            stage,
            reason,
            attempt_count: self.attempt_count + attempts_used,
        };
        self.transition(event, now)
    }

    /// Records a terminal failure.
    pub fn record_terminal_failure(
        &mut self,
        reason: FailureReason,
        attempts_used: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::Failed {
            reason,
            attempt_count: self.attempt_count + attempts_used,
        };
        self.transition(event, now)
    }

    /// Enters `Refunding` from `Captured`.
    pub fn start_refund(&mut self, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::RefundStarted {
            amount: self.amount,
            attempt_count: self.attempt_count,
        };
        self.transition(event, now)
    }

    /// Records a completed refund.
    pub fn record_refunded(
        &mut self,
        refund_reference: impl Into<String>,
        attempts_used: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let event = TransactionEvent::Refunded {
            refund_reference: refund_reference.into(),
            attempt_count: self.attempt_count + attempts_used,
        };
        self.transition(event, now)
    }

    fn transition(
        &mut self,
        event: TransactionEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let from = self.status;
        let to = event.status();

        let allowed = from.can_transition_to(to)
            && (from != TransactionStatus::FailedRetryable
                || to == TransactionStatus::FailedTerminal
                || self.retry_stage.map(|stage| stage.status()) == Some(to));

        if !allowed {
            return Err(TransitionError::InvalidTransition { from, to });
        }

        self.apply(&event, now);
        Ok(Transition {
            from: Some(from),
            event,
            at: now,
        })
    }

    fn apply(&mut self, event: &TransactionEvent, at: DateTime<Utc>) {
        match event {
            TransactionEvent::Created { .. } => {}
            TransactionEvent::AuthorizationStarted { .. }
            | TransactionEvent::CaptureStarted { .. } => {
                self.retry_stage = None;
            }
            TransactionEvent::Authorized {
                provider_reference,
                settled,
                ..
            } => {
                self.provider_reference = Some(provider_reference.clone());
                self.settled = *settled;
                self.last_error = None;
            }
            TransactionEvent::Captured { .. } => {
                self.last_error = None;
            }
            TransactionEvent::RetryScheduled { stage, reason, .. } => {
                self.retry_stage = Some(*stage);
                self.last_error = Some(reason.clone());
            }
            TransactionEvent::Declined { reason, .. } | TransactionEvent::Failed { reason, .. } => {
                self.retry_stage = None;
                self.last_error = Some(reason.clone());
            }
            TransactionEvent::RefundStarted { .. } => {}
            TransactionEvent::Refunded {
                refund_reference, ..
            } => {
                self.refund_reference = Some(refund_reference.clone());
            }
        }

        self.status = event.status();
        self.attempt_count = event.attempt_count();
        self.version = self.version.next();
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Currency;

    fn new_transaction() -> PaymentTransaction {
        let (tx, _) = PaymentTransaction::create(
            TransactionId::new(),
            IdempotencyKey::new("order-1").unwrap(),
            Money::new(5000, Currency::usd()),
            serde_json::json!({"booking_id": "B-1"}),
            "fp",
            Utc::now(),
        )
        .unwrap();
        tx
    }

    #[test]
    fn test_create_starts_at_version_one() {
        let (tx, transition) = PaymentTransaction::create(
            TransactionId::new(),
            IdempotencyKey::new("k").unwrap(),
            Money::new(100, Currency::eur()),
            serde_json::Value::Null,
            "fp",
            Utc::now(),
        )
        .unwrap();

        assert_eq!(tx.status(), TransactionStatus::Created);
        assert_eq!(tx.version(), Version::first());
        assert_eq!(tx.attempt_count(), 0);
        assert!(transition.from.is_none());
    }

    #[test]
    fn test_create_rejects_non_positive_amount() {
        let result = PaymentTransaction::create(
            TransactionId::new(),
            IdempotencyKey::new("k").unwrap(),
            Money::new(0, Currency::usd()),
            serde_json::Value::Null,
            "fp",
            Utc::now(),
        );
        assert!(matches!(result, Err(TransitionError::NonPositiveAmount(_))));
    }

    #[test]
    fn test_full_lifecycle_counts_attempts() {
        let mut tx = new_transaction();
        let now = Utc::now();

        tx.start_authorization(now).unwrap();
        tx.record_retryable_failure(FailureReason::provider_timeout(), 1, now)
            .unwrap();
        assert_eq!(tx.retry_stage(), Some(RetryStage::Authorizing));
        assert_eq!(tx.last_error().unwrap().code, "PROVIDER_TIMEOUT");

        tx.start_authorization(now).unwrap();
        tx.record_authorized("PRV-1", true, 2, now).unwrap();
        tx.start_capture(now).unwrap();
        tx.record_captured(0, now).unwrap();

        assert_eq!(tx.status(), TransactionStatus::Captured);
        assert_eq!(tx.attempt_count(), 3);
        assert_eq!(tx.provider_reference(), Some("PRV-1"));
        assert!(tx.last_error().is_none());
        assert_eq!(tx.version(), Version::new(7));
    }

    #[test]
    fn test_retry_reenters_only_failed_stage() {
        let mut tx = new_transaction();
        let now = Utc::now();
        tx.start_authorization(now).unwrap();
        tx.record_retryable_failure(FailureReason::provider_unavailable(), 1, now)
            .unwrap();

        assert_eq!(
            tx.start_capture(now),
            Err(TransitionError::InvalidTransition {
                from: TransactionStatus::FailedRetryable,
                to: TransactionStatus::Capturing,
            })
        );
        assert!(tx.start_authorization(now).is_ok());
    }

    #[test]
    fn test_invalid_transition_leaves_state_untouched() {
        let mut tx = new_transaction();
        let before = tx.clone();

        assert!(tx.record_captured(1, Utc::now()).is_err());
        assert!(tx.start_refund(Utc::now()).is_err());
        assert_eq!(tx, before);
    }

    #[test]
    fn test_provider_reference_is_immutable() {
        let mut tx = new_transaction();
        let now = Utc::now();
        tx.start_authorization(now).unwrap();
        tx.record_authorized("PRV-1", false, 1, now).unwrap();
        tx.start_capture(now).unwrap();
        tx.record_retryable_failure(FailureReason::settlement_pending(), 1, now)
            .unwrap();

        // Authorization stage is over; the reference stays.
        assert_eq!(tx.provider_reference(), Some("PRV-1"));
        assert_eq!(tx.retry_stage(), Some(RetryStage::Capturing));
    }

    #[test]
    fn test_refund_from_captured() {
        let mut tx = new_transaction();
        let now = Utc::now();
        tx.start_authorization(now).unwrap();
        tx.record_authorized("PRV-1", true, 1, now).unwrap();
        tx.start_capture(now).unwrap();
        tx.record_captured(0, now).unwrap();
        tx.start_refund(now).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Refunding);
        tx.record_refunded("RF-1", 1, now).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Refunded);
        assert_eq!(tx.refund_reference(), Some("RF-1"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let tx = new_transaction();
        let json = serde_json::to_value(&tx).unwrap();
        let back: PaymentTransaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
