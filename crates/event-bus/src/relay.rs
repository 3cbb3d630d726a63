//! Outbox relay: moves committed events from the outbox onto the bus.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::outbox::publish_backoff;
use crate::{EventBus, OutboxStore, Result};

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum entries taken per tick.
    pub batch_size: usize,
    /// Pause between ticks.
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Outcome of a single relay tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
    /// Entries left pending because an earlier event of the same
    /// transaction failed in this tick.
    pub deferred: usize,
}

/// Publishes outbox entries to an [`EventBus`], retrying failures with
/// exponential backoff and never reordering events of one transaction.
pub struct OutboxRelay<O, B>
where
    O: OutboxStore,
    B: EventBus,
{
    outbox: O,
    bus: B,
    config: RelayConfig,
}

impl<O, B> OutboxRelay<O, B>
where
    O: OutboxStore,
    B: EventBus,
{
    /// Creates a relay with default tuning.
    pub fn new(outbox: O, bus: B) -> Self {
        Self::with_config(outbox, bus, RelayConfig::default())
    }

    /// Creates a relay with explicit tuning.
    pub fn with_config(outbox: O, bus: B, config: RelayConfig) -> Self {
        Self {
            outbox,
            bus,
            config,
        }
    }

    /// Runs ticks until `shutdown` becomes true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(batch_size = self.config.batch_size, "outbox relay started");
        loop {
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "outbox relay tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox relay stopped");
    }

    /// Publishes one batch of pending entries.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<RelayReport> {
        let batch = self.outbox.pending(self.config.batch_size, Utc::now()).await?;
        let mut report = RelayReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let mut failed_transactions = HashSet::new();

        for entry in batch {
            let transaction_id = entry.envelope.transaction_id;
            if failed_transactions.contains(&transaction_id) {
                report.deferred += 1;
                continue;
            }

            match self.bus.publish(&entry.envelope).await {
                Ok(()) => {
                    self.outbox.mark_published(entry.id, Utc::now()).await?;
                    metrics::counter!("outbox_published_total").increment(1);
                    report.published += 1;
                }
                Err(err) => {
                    let attempts = entry.attempts + 1;
                    let next_attempt_at = Utc::now() + publish_backoff(attempts);
                    self.outbox
                        .mark_retry(entry.id, attempts, next_attempt_at, &err.to_string())
                        .await?;
                    failed_transactions.insert(transaction_id);
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    tracing::warn!(
                        outbox_id = entry.id,
                        delivery_key = %entry.envelope.delivery_key,
                        attempts,
                        error = %err,
                        "event publish failed, will retry"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
