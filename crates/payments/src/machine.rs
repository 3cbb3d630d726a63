//! Transaction state machine engine.

use chrono::{DateTime, Utc};
use common::{IdempotencyKey, Money, TransactionId};
use domain::{
    DomainError, FailureReason, IdempotencyStore, OutcomeSnapshot, PaymentTransaction, RetryStage,
    TransactionStatus, TransactionStore, Transition, TransitionError, TransitionRecord,
};
use gateway::{
    Attempted, ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway, RefundRequest,
    ResilientGateway, SettlementStatus,
};

use crate::locks::TransactionLocks;
use crate::{PaymentError, Result};

#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Provider calls allowed per transaction for the charge lifecycle.
    pub max_attempts: u32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// What a single [`TransactionStateMachine::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// One transition was committed.
    Advanced {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    /// Nothing left to do automatically.
    Terminal { status: TransactionStatus },
    /// The provider's circuit is open; the transaction was parked in
    /// `FailedRetryable` without spending attempts on the rejected call.
    CircuitOpen,
    /// The refund call failed; the transaction stays `Refunding`.
    RefundPending { reason: FailureReason },
    /// Another writer moved the transaction on first; nothing was committed.
    Superseded { status: TransactionStatus },
}

/// Maps a provider error to the reason recorded on the transaction.
pub fn failure_reason(error: &GatewayError) -> FailureReason {
    match error {
        GatewayError::Timeout => FailureReason::provider_timeout(),
        GatewayError::ServerError { .. } => FailureReason::provider_unavailable(),
        GatewayError::ConnectionFailed(_) => FailureReason::connection_failed(),
        GatewayError::Validation { code } => FailureReason::invalid_request(code),
        GatewayError::Provider { code } => FailureReason::provider_error(code, error.is_retryable()),
        GatewayError::CircuitOpen { .. } => FailureReason::circuit_open(),
    }
}

/// Drives payment transactions through their lifecycle.
///
/// Every step runs under the transaction's single-writer token, reloads the
/// transaction, performs at most one provider operation and commits exactly
/// one transition (with its audit row and outbox entry). Provider calls are
/// made while holding only that token.
pub struct TransactionStateMachine<S, I, G> {
    store: S,
    idempotency: I,
    gateway: ResilientGateway<G>,
    locks: TransactionLocks,
    config: StateMachineConfig,
}

impl<S, I, G> TransactionStateMachine<S, I, G>
where
    S: TransactionStore,
    I: IdempotencyStore,
    G: PaymentGateway,
{
    pub fn new(
        store: S,
        idempotency: I,
        gateway: ResilientGateway<G>,
        config: StateMachineConfig,
    ) -> Self {
        Self {
            store,
            idempotency,
            gateway,
            locks: TransactionLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn idempotency(&self) -> &I {
        &self.idempotency
    }

    pub fn gateway(&self) -> &ResilientGateway<G> {
        &self.gateway
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Persists a new transaction in `Created`.
    ///
    /// Creating an id that already exists returns the stored transaction.
    #[tracing::instrument(skip(self, payload, fingerprint))]
    pub async fn create(
        &self,
        id: TransactionId,
        key: IdempotencyKey,
        amount: Money,
        payload: serde_json::Value,
        fingerprint: &str,
    ) -> Result<PaymentTransaction> {
        let (transaction, transition) =
            PaymentTransaction::create(id, key, amount, payload, fingerprint, Utc::now())?;
        let record = TransitionRecord::new(&transaction, &transition)?;

        match self.store.create(&transaction, record).await {
            Ok(()) => {
                metrics::counter!("payment_transitions_total", "to" => TransactionStatus::Created.as_str())
                    .increment(1);
                tracing::info!(transaction_id = %id, "transaction created");
                Ok(transaction)
            }
            Err(DomainError::DuplicateTransaction(_)) => self.load(id).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Loads a transaction.
    pub async fn load(&self, id: TransactionId) -> Result<PaymentTransaction> {
        self.store
            .get(id)
            .await?
            .ok_or(PaymentError::NotFound(id))
    }

    /// Attempts exactly one transition.
    #[tracing::instrument(skip(self), fields(transaction_id = %id))]
    pub async fn advance(&self, id: TransactionId) -> Result<StepOutcome> {
        let _token = self.locks.acquire(id).await;
        self.step(id).await
    }

    /// Advances until the transaction is terminal or parked in
    /// `FailedRetryable`, and returns its final state.
    #[tracing::instrument(skip(self), fields(transaction_id = %id))]
    pub async fn drive(&self, id: TransactionId) -> Result<PaymentTransaction> {
        loop {
            match self.advance(id).await? {
                StepOutcome::Advanced {
                    to: TransactionStatus::FailedRetryable,
                    ..
                } => break,
                StepOutcome::Advanced { .. } | StepOutcome::Superseded { .. } => continue,
                StepOutcome::Terminal { .. }
                | StepOutcome::CircuitOpen
                | StepOutcome::RefundPending { .. } => break,
            }
        }
        self.load(id).await
    }

    /// Starts a refund of a captured transaction and drives it.
    ///
    /// Repeating the request for a transaction already refunding or refunded
    /// just drives it.
    #[tracing::instrument(skip(self), fields(transaction_id = %id))]
    pub async fn refund(&self, id: TransactionId) -> Result<PaymentTransaction> {
        {
            let _token = self.locks.acquire(id).await;
            let transaction = self.load(id).await?;
            match transaction.status() {
                TransactionStatus::Captured => {
                    self.commit(transaction, |t, now| t.start_refund(now)).await?;
                }
                TransactionStatus::Refunding | TransactionStatus::Refunded => {}
                status => {
                    return Err(PaymentError::InvalidState {
                        transaction_id: id,
                        status,
                        operation: "refund",
                    });
                }
            }
        }
        self.drive(id).await
    }

    async fn step(&self, id: TransactionId) -> Result<StepOutcome> {
        let transaction = self.load(id).await?;

        match transaction.status() {
            TransactionStatus::Created => {
                self.commit(transaction, |t, now| t.start_authorization(now))
                    .await
            }
            TransactionStatus::Authorizing => self.authorize(transaction).await,
            TransactionStatus::Authorized => {
                self.commit(transaction, |t, now| t.start_capture(now)).await
            }
            TransactionStatus::Capturing => self.capture(transaction).await,
            TransactionStatus::FailedRetryable => self.resume(transaction).await,
            TransactionStatus::Refunding => self.refund_step(transaction).await,
            status @ (TransactionStatus::Captured
            | TransactionStatus::Declined
            | TransactionStatus::FailedTerminal
            | TransactionStatus::Refunded) => Ok(StepOutcome::Terminal { status }),
        }
    }

    fn budget(&self, transaction: &PaymentTransaction) -> u32 {
        transaction.remaining_attempts(self.config.max_attempts)
    }

    async fn exhausted(&self, transaction: PaymentTransaction) -> Result<StepOutcome> {
        tracing::warn!(
            attempts = transaction.attempt_count(),
            "attempt limit reached"
        );
        self.commit(transaction, |t, now| {
            t.record_terminal_failure(FailureReason::attempts_exhausted(), 0, now)
        })
        .await
    }

    async fn authorize(&self, transaction: PaymentTransaction) -> Result<StepOutcome> {
        let budget = self.budget(&transaction);
        if budget == 0 {
            return self.exhausted(transaction).await;
        }

        let request = ChargeRequest {
            reference: transaction.id(),
            amount: transaction.amount(),
        };
        let Attempted { result, attempts } = self.gateway.charge(&request, budget).await;

        match result {
            Ok(ChargeOutcome::Approved { provider_reference }) => {
                self.commit(transaction, move |t, now| {
                    t.record_authorized(provider_reference.clone(), true, attempts, now)
                })
                .await
            }
            Ok(ChargeOutcome::Pending { provider_reference }) => {
                self.commit(transaction, move |t, now| {
                    t.record_authorized(provider_reference.clone(), false, attempts, now)
                })
                .await
            }
            Ok(ChargeOutcome::Declined { code }) => {
                tracing::info!(code = %code, "charge declined");
                self.commit(transaction, move |t, now| {
                    t.record_declined(FailureReason::declined(&code), attempts, now)
                })
                .await
            }
            Err(e) => self.provider_failed(transaction, e, attempts).await,
        }
    }

    /// Settlement polls never spend the charge attempt budget. An accepted
    /// charge stays `FailedRetryable` until the provider settles or rejects it.
    async fn capture(&self, transaction: PaymentTransaction) -> Result<StepOutcome> {
        if transaction.is_settled() {
            return self
                .commit(transaction, |t, now| t.record_captured(0, now))
                .await;
        }

        let Some(provider_reference) = transaction.provider_reference().map(str::to_string) else {
            return Err(PaymentError::InvalidState {
                transaction_id: transaction.id(),
                status: transaction.status(),
                operation: "capture without a provider reference",
            });
        };

        let budget = self.gateway.config().retry.max_attempts;
        let Attempted { result, .. } = self
            .gateway
            .settlement_status(&provider_reference, budget)
            .await;

        match result {
            Ok(SettlementStatus::Settled) => {
                self.commit(transaction, |t, now| t.record_captured(0, now))
                    .await
            }
            Ok(SettlementStatus::Pending) => {
                self.settlement_later(transaction, FailureReason::settlement_pending())
                    .await
            }
            Ok(SettlementStatus::Rejected { code }) => {
                tracing::warn!(code = %code, "settlement rejected");
                self.commit(transaction, move |t, now| {
                    t.record_terminal_failure(FailureReason::rejected(&code), 0, now)
                })
                .await
            }
            Err(e) if e.is_retryable() => {
                self.settlement_later(transaction, failure_reason(&e)).await
            }
            Err(e) => self.provider_failed(transaction, e, 0).await,
        }
    }

    async fn settlement_later(
        &self,
        transaction: PaymentTransaction,
        reason: FailureReason,
    ) -> Result<StepOutcome> {
        tracing::info!(
            reason = %reason,
            provider_reference = transaction.provider_reference(),
            "settlement not confirmed, will verify again"
        );
        metrics::counter!("payment_settlement_pending_total", "reason" => reason.code.clone())
            .increment(1);
        self.commit(transaction, move |t, now| {
            t.record_retryable_failure(reason.clone(), 0, now)
        })
        .await
    }

    async fn resume(&self, transaction: PaymentTransaction) -> Result<StepOutcome> {
        match transaction.retry_stage() {
            Some(RetryStage::Authorizing) if self.budget(&transaction) == 0 => {
                self.exhausted(transaction).await
            }
            Some(RetryStage::Authorizing) => {
                self.commit(transaction, |t, now| t.start_authorization(now))
                    .await
            }
            Some(RetryStage::Capturing) => {
                self.commit(transaction, |t, now| t.start_capture(now)).await
            }
            None => Err(PaymentError::InvalidState {
                transaction_id: transaction.id(),
                status: transaction.status(),
                operation: "resume without a retry stage",
            }),
        }
    }

    async fn refund_step(&self, transaction: PaymentTransaction) -> Result<StepOutcome> {
        let Some(provider_reference) = transaction.provider_reference().map(str::to_string) else {
            return Err(PaymentError::InvalidState {
                transaction_id: transaction.id(),
                status: transaction.status(),
                operation: "refund without a provider reference",
            });
        };

        let request = RefundRequest {
            reference: transaction.id(),
            provider_reference,
            amount: transaction.amount(),
        };
        let budget = self.gateway.config().retry.max_attempts;
        let Attempted { result, attempts } = self.gateway.refund(&request, budget).await;

        match result {
            Ok(receipt) => {
                self.commit(transaction, move |t, now| {
                    t.record_refunded(receipt.refund_reference.clone(), attempts, now)
                })
                .await
            }
            Err(e) => {
                let reason = failure_reason(&e);
                if e.is_retryable() || matches!(e, GatewayError::CircuitOpen { .. }) {
                    tracing::warn!(reason = %reason, attempts, "refund failed, will retry");
                } else {
                    tracing::error!(
                        transaction_id = %transaction.id(),
                        reason = %reason,
                        "refund rejected by provider, needs manual intervention"
                    );
                }
                metrics::counter!("payment_refund_failures_total", "reason" => reason.code.clone())
                    .increment(1);
                Ok(StepOutcome::RefundPending { reason })
            }
        }
    }

    async fn provider_failed(
        &self,
        transaction: PaymentTransaction,
        error: GatewayError,
        attempts: u32,
    ) -> Result<StepOutcome> {
        let reason = failure_reason(&error);

        if matches!(error, GatewayError::CircuitOpen { .. }) {
            let outcome = self
                .commit(transaction, move |t, now| {
                    t.record_retryable_failure(reason.clone(), attempts, now)
                })
                .await?;
            return Ok(match outcome {
                StepOutcome::Advanced { .. } => StepOutcome::CircuitOpen,
                other => other,
            });
        }

        if error.is_retryable() {
            return self.retry_later(transaction, reason, attempts).await;
        }

        tracing::warn!(reason = %reason, attempts, "provider call failed permanently");
        self.commit(transaction, move |t, now| {
            t.record_terminal_failure(reason.clone(), attempts, now)
        })
        .await
    }

    /// Parks the transaction in `FailedRetryable`, or fails it when this
    /// step used up the remaining attempts.
    async fn retry_later(
        &self,
        transaction: PaymentTransaction,
        reason: FailureReason,
        attempts: u32,
    ) -> Result<StepOutcome> {
        if transaction.attempt_count() + attempts >= self.config.max_attempts {
            tracing::warn!(reason = %reason, attempts, "attempts exhausted");
            return self
                .commit(transaction, move |t, now| {
                    t.record_terminal_failure(FailureReason::attempts_exhausted(), attempts, now)
                })
                .await;
        }

        tracing::info!(reason = %reason, attempts, "retry scheduled");
        self.commit(transaction, move |t, now| {
            t.record_retryable_failure(reason.clone(), attempts, now)
        })
        .await
    }

    /// Applies a transition to `transaction` and commits it against the
    /// loaded version. On a version conflict the transaction is reloaded once
    /// and the transition re-applied if its status is unchanged.
    async fn commit<F>(&self, mut transaction: PaymentTransaction, apply: F) -> Result<StepOutcome>
    where
        F: Fn(&mut PaymentTransaction, DateTime<Utc>) -> std::result::Result<Transition, TransitionError>
            + Send,
    {
        let from = transaction.status();
        let mut reloaded = false;

        loop {
            let expected = transaction.version();
            let mut next = transaction.clone();
            let transition = apply(&mut next, Utc::now())?;
            let record = TransitionRecord::new(&next, &transition)?;

            match self.store.commit(&next, expected, record).await {
                Ok(()) => {
                    self.committed(&next).await;
                    return Ok(StepOutcome::Advanced {
                        from,
                        to: next.status(),
                    });
                }
                Err(DomainError::ConcurrencyConflict { actual, .. }) if !reloaded => {
                    tracing::warn!(%expected, %actual, "concurrent update, reloading");
                    reloaded = true;
                    transaction = self.load(transaction.id()).await?;
                    if transaction.status() != from {
                        return Ok(StepOutcome::Superseded {
                            status: transaction.status(),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn committed(&self, transaction: &PaymentTransaction) {
        let status = transaction.status();
        metrics::counter!("payment_transitions_total", "to" => status.as_str()).increment(1);
        tracing::info!(
            transaction_id = %transaction.id(),
            status = %status,
            version = %transaction.version(),
            attempts = transaction.attempt_count(),
            "transition committed"
        );

        if !status.is_terminal() {
            return;
        }

        metrics::counter!("payment_terminal_total", "status" => status.as_str()).increment(1);
        let outcome = OutcomeSnapshot::of(transaction, Utc::now());
        // The transaction row already holds the outcome; replays fall back to it.
        if let Err(e) = self
            .idempotency
            .record_outcome(transaction.idempotency_key(), outcome)
            .await
        {
            tracing::warn!(
                transaction_id = %transaction.id(),
                error = %e,
                "failed to record idempotency outcome"
            );
        }
    }
}
