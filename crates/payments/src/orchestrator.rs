//! Request path: idempotent submission and outcome reporting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{IdempotencyKey, Money, TransactionId};
use domain::{
    DEFAULT_RETENTION_HOURS, FailureReason, IdempotencyStore, OutcomeSnapshot, PaymentTransaction,
    Reservation, TransactionStatus, TransactionStore, derive_key, fingerprint, reason,
};
use gateway::PaymentGateway;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;

use crate::machine::{StepOutcome, TransactionStateMachine};
use crate::{PaymentError, Result};

/// An inbound payment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Derived from the request content when absent.
    pub idempotency_key: Option<IdempotencyKey>,
    pub amount: Money,
    /// Opaque business context, carried on every transition event.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// How long `submit` waits for the transaction to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Wait up to the given time, then report the transaction as in flight.
    Wait(Duration),
    /// Return immediately with the in-flight transaction.
    Detach,
}

/// What the caller is told about a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub provider_reference: Option<String>,
    pub reason: Option<FailureReason>,
    pub attempt_count: u32,
    /// Answered from an earlier submission with the same key.
    pub replayed: bool,
    /// The transaction was still progressing when the answer was produced.
    pub in_flight: bool,
}

impl PaymentOutcome {
    fn from_snapshot(snapshot: OutcomeSnapshot, replayed: bool, in_flight: bool) -> Self {
        Self {
            transaction_id: snapshot.transaction_id,
            status: snapshot.status,
            provider_reference: snapshot.provider_reference,
            reason: snapshot.reason,
            attempt_count: snapshot.attempt_count,
            replayed,
            in_flight,
        }
    }

    fn of(transaction: &PaymentTransaction, replayed: bool, in_flight: bool) -> Self {
        Self::from_snapshot(OutcomeSnapshot::of(transaction, Utc::now()), replayed, in_flight)
    }

    /// Snapshot of `transaction`, in flight unless the engine stopped on it.
    fn current(transaction: &PaymentTransaction) -> Self {
        Self::of(transaction, false, !is_resting(transaction))
    }

    /// Declined or failed for good: resubmitting the same request will not
    /// change the answer.
    pub fn is_definite_failure(&self) -> bool {
        self.status.is_definite_failure()
    }

    /// Not settled yet because the provider is temporarily unavailable or
    /// the transaction is still running.
    pub fn is_transient(&self) -> bool {
        self.in_flight || self.status == TransactionStatus::FailedRetryable
    }
}

/// The engine stops driving a transaction once it is terminal or parked for
/// a later retry.
fn is_resting(transaction: &PaymentTransaction) -> bool {
    transaction.is_terminal() || transaction.status() == TransactionStatus::FailedRetryable
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between store reads while waiting for an outcome.
    pub poll_interval: Duration,
    pub idempotency_retention: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            idempotency_retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
        }
    }
}

/// Entry point for payment requests.
///
/// Transactions are driven on spawned tasks, so a caller that stops waiting
/// never interrupts a provider call in progress.
pub struct Orchestrator<S, I, G> {
    machine: Arc<TransactionStateMachine<S, I, G>>,
    config: OrchestratorConfig,
}

impl<S, I, G> Clone for Orchestrator<S, I, G> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, I, G> Orchestrator<S, I, G>
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    pub fn new(machine: Arc<TransactionStateMachine<S, I, G>>, config: OrchestratorConfig) -> Self {
        Self { machine, config }
    }

    pub fn machine(&self) -> &Arc<TransactionStateMachine<S, I, G>> {
        &self.machine
    }

    /// Submits a payment.
    ///
    /// A key seen before with the same content returns the recorded outcome
    /// (or waits for the transaction it started) without calling the
    /// provider again; the same key with different content is an
    /// [`PaymentError::IdempotencyConflict`].
    #[tracing::instrument(skip(self, request), fields(amount = %request.amount, idempotency_key))]
    pub async fn submit(&self, request: PaymentRequest, mode: SubmitMode) -> Result<PaymentOutcome> {
        let PaymentRequest {
            idempotency_key,
            amount,
            payload,
        } = request;

        if !amount.is_positive() {
            return Err(PaymentError::InvalidRequest(format!(
                "amount must be positive, got {amount}"
            )));
        }

        let key = match idempotency_key {
            Some(key) => key,
            None => derive_key(&amount, &payload)?,
        };
        tracing::Span::current().record("idempotency_key", key.as_str());
        let fingerprint = fingerprint(&amount, &payload)?;

        let reservation = self
            .machine
            .idempotency()
            .get_or_create(
                &key,
                &fingerprint,
                TransactionId::new(),
                self.config.idempotency_retention,
                Utc::now(),
            )
            .await?;

        let (transaction_id, replayed) = match reservation {
            Reservation::Existing(record) => {
                if let Some(outcome) = record.outcome {
                    metrics::counter!("payment_replays_total").increment(1);
                    tracing::debug!(transaction_id = %outcome.transaction_id, "replaying recorded outcome");
                    return Ok(PaymentOutcome::from_snapshot(outcome, true, false));
                }
                // The first submission may not have persisted its transaction yet.
                if self.machine.store().get(record.transaction_id).await?.is_none() {
                    self.start(record.transaction_id, key, amount, payload, &fingerprint)
                        .await?;
                }
                (record.transaction_id, true)
            }
            Reservation::Reserved { transaction_id } => {
                metrics::counter!("payment_submissions_total").increment(1);
                self.start(transaction_id, key, amount, payload, &fingerprint)
                    .await?;
                (transaction_id, false)
            }
        };

        self.wait(transaction_id, mode, replayed).await
    }

    async fn start(
        &self,
        id: TransactionId,
        key: IdempotencyKey,
        amount: Money,
        payload: serde_json::Value,
        fingerprint: &str,
    ) -> Result<()> {
        self.machine
            .create(id, key, amount, payload, fingerprint)
            .await?;

        let machine = self.machine.clone();
        let span = tracing::info_span!("drive_transaction", transaction_id = %id);
        tokio::spawn(
            async move {
                if let Err(e) = machine.drive(id).await {
                    tracing::error!(error = %e, "drive failed, reconciliation will resume it");
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn wait(
        &self,
        id: TransactionId,
        mode: SubmitMode,
        replayed: bool,
    ) -> Result<PaymentOutcome> {
        let deadline = match mode {
            SubmitMode::Wait(timeout) => Instant::now() + timeout,
            SubmitMode::Detach => Instant::now(),
        };

        loop {
            let transaction = self.machine.load(id).await?;

            if transaction.status() == TransactionStatus::FailedRetryable
                && transaction
                    .last_error()
                    .is_some_and(|r| r.code == reason::CIRCUIT_OPEN)
            {
                return Err(PaymentError::CircuitOpen { transaction_id: id });
            }
            if is_resting(&transaction) {
                return Ok(PaymentOutcome::of(&transaction, replayed, false));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PaymentOutcome::of(&transaction, replayed, true));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Runs one engine step and reports the resulting state.
    pub async fn advance(&self, id: TransactionId) -> Result<PaymentOutcome> {
        let step = self.machine.advance(id).await?;
        if step == StepOutcome::CircuitOpen {
            return Err(PaymentError::CircuitOpen { transaction_id: id });
        }
        let transaction = self.machine.load(id).await?;
        Ok(PaymentOutcome::current(&transaction))
    }

    /// Current state of a transaction.
    pub async fn status(&self, id: TransactionId) -> Result<PaymentOutcome> {
        let transaction = self.machine.load(id).await?;
        Ok(PaymentOutcome::current(&transaction))
    }

    /// Refunds a captured transaction.
    pub async fn refund(&self, id: TransactionId) -> Result<PaymentOutcome> {
        let transaction = self.machine.refund(id).await?;
        Ok(PaymentOutcome::current(&transaction))
    }
}
