//! Consumer-side deduplication and dead-lettering.
//!
//! Delivery is at-least-once, so every consumer routes events through a
//! [`DeduplicatingConsumer`], which remembers processed delivery keys in a
//! [`DeliveryLedger`] and hands each transition to the handler at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{DeliveryKey, EventEnvelope, EventStream, Result, TransactionId};

/// Longest error text kept on a ledger record or dead letter.
pub const MAX_ERROR_LEN: usize = 1000;

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the event should be delivered again.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The event can never be processed and goes to the dead-letter list.
    #[error("poison: {0}")]
    Poison(String),
}

/// Business logic run for each distinct transition.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError>;
}

/// Terminal processing status of a delivery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// The handler accepted the event.
    Success,
    /// The event was dead-lettered and will not be processed again.
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// One processed delivery key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_key: DeliveryKey,
    pub transaction_id: TransactionId,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Persistent memory of processed delivery keys.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Returns the record for `key`, if the key has been processed.
    async fn find(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>>;

    /// Records a processed key. Recording an existing key is a no-op.
    async fn record(&self, record: DeliveryRecord) -> Result<()>;
}

/// Ledger kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryDeliveryLedger {
    records: Arc<Mutex<HashMap<DeliveryKey, DeliveryRecord>>>,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded keys.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDeliveryLedger {
    async fn find(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    async fn record(&self, record: DeliveryRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(record.delivery_key.clone())
            .or_insert(record);
        Ok(())
    }
}

/// An event that could not be processed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// What happened to a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// First delivery of this key; the handler succeeded.
    Processed,
    /// The key was already processed; the handler was not called.
    Duplicate,
    /// The handler rejected the event as poison.
    DeadLettered,
}

/// How [`DeduplicatingConsumer::run`] re-attempts a delivery that was not
/// acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redelivery {
    /// Deliveries per event, including the first.
    pub max_attempts: u32,
    /// Pause before the second delivery; doubles after each failure.
    pub initial_backoff: Duration,
}

impl Default for Redelivery {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Wraps an [`EventHandler`] with delivery-key deduplication.
pub struct DeduplicatingConsumer<H, L>
where
    H: EventHandler,
    L: DeliveryLedger,
{
    name: String,
    handler: H,
    ledger: L,
    redelivery: Redelivery,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl<H, L> DeduplicatingConsumer<H, L>
where
    H: EventHandler,
    L: DeliveryLedger,
{
    pub fn new(name: impl Into<String>, handler: H, ledger: L) -> Self {
        Self {
            name: name.into(),
            handler,
            ledger,
            redelivery: Redelivery::default(),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_redelivery(mut self, redelivery: Redelivery) -> Self {
        self.redelivery = redelivery;
        self
    }

    /// Returns the wrapped handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the dead letters collected so far.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Processes one delivery.
    ///
    /// A retryable handler failure is returned as an error and nothing is
    /// recorded, so the next delivery of the same key runs the handler again.
    #[tracing::instrument(skip(self, event), fields(consumer = %self.name, delivery_key = %event.delivery_key))]
    pub async fn deliver(
        &self,
        event: &EventEnvelope,
    ) -> std::result::Result<Delivery, ConsumerError> {
        if self.ledger.find(&event.delivery_key).await?.is_some() {
            tracing::debug!("duplicate delivery dropped");
            metrics::counter!("consumer_duplicates_total", "consumer" => self.name.clone())
                .increment(1);
            return Ok(Delivery::Duplicate);
        }

        match self.handler.handle(event).await {
            Ok(()) => {
                self.ledger
                    .record(self.record(event, DeliveryStatus::Success, None))
                    .await?;
                metrics::counter!("consumer_processed_total", "consumer" => self.name.clone())
                    .increment(1);
                Ok(Delivery::Processed)
            }
            Err(HandlerError::Poison(reason)) => {
                let reason = truncate_error(&reason);
                tracing::error!(reason = %reason, "event dead-lettered");
                self.dead_letters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(DeadLetter {
                        envelope: event.clone(),
                        reason: reason.clone(),
                        at: Utc::now(),
                    });
                self.ledger
                    .record(self.record(event, DeliveryStatus::Skipped, Some(reason)))
                    .await?;
                metrics::counter!("consumer_dead_letters_total", "consumer" => self.name.clone())
                    .increment(1);
                Ok(Delivery::DeadLettered)
            }
            Err(err @ HandlerError::Retryable(_)) => {
                tracing::warn!(error = %err, "event handling failed, awaiting redelivery");
                Err(ConsumerError::Handler(err))
            }
        }
    }

    /// Consumes `stream` until it ends.
    ///
    /// An event that is not acknowledged is delivered again locally, with
    /// backoff, up to the [`Redelivery`] limit. After that it is
    /// dead-lettered without a ledger record, so a later broker redelivery
    /// can still process it.
    pub async fn run(&self, mut stream: EventStream) {
        while let Some(event) = stream.next().await {
            self.consume(&event).await;
        }
    }

    async fn consume(&self, event: &EventEnvelope) {
        let max_attempts = self.redelivery.max_attempts.max(1);
        let mut backoff = self.redelivery.initial_backoff;

        for attempt in 1..=max_attempts {
            let err = match self.deliver(event).await {
                Ok(_) => return,
                Err(err) => err,
            };
            tracing::warn!(
                consumer = %self.name,
                delivery_key = %event.delivery_key,
                attempt,
                error = %err,
                "delivery not acknowledged"
            );

            if attempt == max_attempts {
                let reason = truncate_error(&format!(
                    "not acknowledged after {max_attempts} deliveries: {err}"
                ));
                tracing::error!(
                    consumer = %self.name,
                    delivery_key = %event.delivery_key,
                    "redeliveries exhausted, event dead-lettered"
                );
                self.dead_letters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(DeadLetter {
                        envelope: event.clone(),
                        reason,
                        at: Utc::now(),
                    });
                metrics::counter!("consumer_dead_letters_total", "consumer" => self.name.clone())
                    .increment(1);
                return;
            }

            metrics::counter!("consumer_redeliveries_total", "consumer" => self.name.clone())
                .increment(1);
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    fn record(
        &self,
        event: &EventEnvelope,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> DeliveryRecord {
        DeliveryRecord {
            delivery_key: event.delivery_key.clone(),
            transaction_id: event.transaction_id,
            status,
            error,
            processed_at: Utc::now(),
        }
    }
}

/// Failure of [`DeduplicatingConsumer::deliver`].
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Handler(HandlerError),

    #[error(transparent)]
    Ledger(#[from] crate::EventBusError),
}

/// Caps error text at [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}
