//! Periodic, lease-guarded resumption of stalled transactions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TransactionId;
use domain::{IdempotencyStore, TransactionStatus, TransactionStore};
use gateway::PaymentGateway;
use payments::TransactionStateMachine;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::Result;
use crate::lease::{Lease, LeaseStore};

/// Work the scheduler knows how to find and resume.
#[async_trait]
pub trait Reconcilable: Send + Sync {
    /// Non-terminal transactions not updated since `updated_before`, oldest
    /// first.
    async fn stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionId>>;

    /// Drives one transaction as far as it will go and returns its status.
    async fn reconcile(&self, id: TransactionId) -> Result<TransactionStatus>;
}

#[async_trait]
impl<S, I, G> Reconcilable for TransactionStateMachine<S, I, G>
where
    S: TransactionStore,
    I: IdempotencyStore,
    G: PaymentGateway,
{
    async fn stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionId>> {
        let transactions = self.store().find_stale(updated_before, limit).await?;
        Ok(transactions.iter().map(|t| t.id()).collect())
    }

    async fn reconcile(&self, id: TransactionId) -> Result<TransactionStatus> {
        Ok(self.drive(id).await?.status())
    }
}

#[async_trait]
impl<R: Reconcilable + ?Sized> Reconcilable for Arc<R> {
    async fn stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionId>> {
        (**self).stale(updated_before, limit).await
    }

    async fn reconcile(&self, id: TransactionId) -> Result<TransactionStatus> {
        (**self).reconcile(id).await
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycles.
    pub interval: Duration,
    pub lease_name: String,
    pub lease_ttl: chrono::Duration,
    /// How long a transaction must sit untouched before it is resumed.
    pub staleness: chrono::Duration,
    /// Maximum transactions taken per cycle.
    pub batch_limit: usize,
    /// Renew the lease after this many transactions, and in any case once a
    /// third of `lease_ttl` has elapsed.
    pub renew_every: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lease_name: "payment-reconciliation".to_string(),
            lease_ttl: chrono::Duration::seconds(30),
            staleness: chrono::Duration::minutes(5),
            batch_limit: 100,
            renew_every: 10,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleReport {
    /// Another node holds the lease.
    Skipped,
    Completed {
        advanced: usize,
        failed: usize,
    },
    /// The lease was lost mid-cycle; `remaining` transactions were left for
    /// the next holder.
    Aborted {
        advanced: usize,
        failed: usize,
        remaining: usize,
    },
}

impl CycleReport {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Resumes stale transactions while this node holds the reconciliation
/// lease.
pub struct ReconciliationScheduler<L, R> {
    node_id: String,
    leases: L,
    target: R,
    config: SchedulerConfig,
}

impl<L, R> ReconciliationScheduler<L, R>
where
    L: LeaseStore,
    R: Reconcilable,
{
    pub fn new(node_id: impl Into<String>, leases: L, target: R, config: SchedulerConfig) -> Self {
        Self {
            node_id: node_id.into(),
            leases,
            target,
            config,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs cycles every `interval` until `shutdown` becomes true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            node_id = %self.node_id,
            interval_secs = self.config.interval.as_secs(),
            "reconciliation scheduler started"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        metrics::counter!("reconciliation_cycles_total", "outcome" => "error")
                            .increment(1);
                        tracing::error!(error = %err, "reconciliation cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(node_id = %self.node_id, "reconciliation scheduler stopped");
    }

    /// Runs one cycle if the lease can be taken.
    #[tracing::instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let lease = self
            .leases
            .acquire(
                &self.config.lease_name,
                &self.node_id,
                self.config.lease_ttl,
                Utc::now(),
            )
            .await?;

        let Some(mut lease) = lease else {
            tracing::debug!(lease = %self.config.lease_name, "lease held elsewhere, skipping cycle");
            metrics::counter!("reconciliation_cycles_total", "outcome" => "skipped").increment(1);
            return Ok(CycleReport::Skipped);
        };

        let report = self.process(&mut lease).await;

        if !matches!(report, Ok(CycleReport::Aborted { .. }))
            && let Err(err) = self.leases.release(&lease).await
        {
            tracing::warn!(error = %err, "failed to release reconciliation lease");
        }

        let report = report?;
        metrics::counter!("reconciliation_cycles_total", "outcome" => report.outcome())
            .increment(1);
        match report {
            CycleReport::Completed { advanced: 0, failed: 0 } => {
                tracing::debug!("no stale transactions");
            }
            _ => tracing::info!(?report, "reconciliation cycle finished"),
        }
        Ok(report)
    }

    async fn process(&self, lease: &mut Lease) -> Result<CycleReport> {
        let before = Utc::now() - self.config.staleness;
        let stale = self.target.stale(before, self.config.batch_limit).await?;
        let renew_every = self.config.renew_every.max(1);
        let ttl = self.config.lease_ttl;
        // Renew once a third of the lease has been used.
        let renew_below = ttl - ttl / 3;

        let mut advanced = 0;
        let mut failed = 0;

        for (i, id) in stale.iter().copied().enumerate() {
            let now = Utc::now();
            let due = i > 0 && i % renew_every == 0;
            if (due || lease.expires_at - now <= renew_below) && !self.renew(lease).await {
                return Ok(self.abort(advanced, failed, stale.len() - i));
            }

            let Ok(remaining) = (lease.expires_at - Utc::now()).to_std() else {
                return Ok(self.abort(advanced, failed, stale.len() - i));
            };
            match tokio::time::timeout(remaining, self.target.reconcile(id)).await {
                Ok(Ok(status)) => {
                    advanced += 1;
                    metrics::counter!("reconciliation_advanced_total").increment(1);
                    tracing::debug!(transaction_id = %id, status = %status, "transaction resumed");
                }
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::warn!(transaction_id = %id, error = %err, "failed to resume transaction");
                }
                Err(_) => {
                    tracing::warn!(transaction_id = %id, "transaction outlived the reconciliation lease");
                    return Ok(self.abort(advanced, failed, stale.len() - i));
                }
            }
        }

        if lease.is_expired(Utc::now()) {
            return Ok(self.abort(advanced, failed, 0));
        }
        Ok(CycleReport::Completed { advanced, failed })
    }

    /// Extends the lease in place. False once it is gone.
    async fn renew(&self, lease: &mut Lease) -> bool {
        match self.leases.renew(lease, self.config.lease_ttl, Utc::now()).await {
            Ok(Some(renewed)) => {
                *lease = renewed;
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(error = %err, "lease renewal failed");
                false
            }
        }
    }

    fn abort(&self, advanced: usize, failed: usize, remaining: usize) -> CycleReport {
        tracing::warn!(remaining, "reconciliation lease lost, aborting cycle");
        CycleReport::Aborted {
            advanced,
            failed,
            remaining,
        }
    }
}
