use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TransactionId;
use event_bus::{EventEnvelope, OutboxEntry, OutboxLog, OutboxStore, Version};
use tokio::sync::RwLock;

use crate::audit::AuditRecord;
use crate::store::{TransactionStore, TransitionRecord};
use crate::transaction::PaymentTransaction;
use crate::{DomainError, Result};

#[derive(Default)]
struct State {
    transactions: HashMap<TransactionId, PaymentTransaction>,
    audit: HashMap<TransactionId, Vec<AuditRecord>>,
    outbox: OutboxLog,
}

impl State {
    fn append(&mut self, record: TransitionRecord) {
        self.audit
            .entry(record.audit.transaction_id)
            .or_default()
            .push(record.audit);
        self.outbox.append(record.envelope);
    }
}

/// In-memory transaction store for tests and single-node runs.
///
/// One lock guards transactions, audit rows and the outbox, so a transition
/// and its event are never observable apart. Doubles as the relay's
/// [`OutboxStore`].
#[derive(Clone, Default)]
pub struct InMemoryTransactionStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryTransactionStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored transactions.
    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }

    /// Returns the retained outbox envelopes written for `id`, in transition
    /// order.
    pub async fn events_for(&self, id: TransactionId) -> Vec<EventEnvelope> {
        self.state
            .read()
            .await
            .outbox
            .entries()
            .iter()
            .filter(|entry| entry.envelope.transaction_id == id)
            .map(|entry| entry.envelope.clone())
            .collect()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(
        &self,
        transaction: &PaymentTransaction,
        record: TransitionRecord,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&transaction.id()) {
            return Err(DomainError::DuplicateTransaction(transaction.id()));
        }

        state
            .transactions
            .insert(transaction.id(), transaction.clone());
        state.append(record);
        Ok(())
    }

    async fn commit(
        &self,
        transaction: &PaymentTransaction,
        expected: Version,
        record: TransitionRecord,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let id = transaction.id();

        let actual = state
            .transactions
            .get(&id)
            .map(|stored| stored.version())
            .ok_or(DomainError::TransactionNotFound(id))?;

        if actual != expected {
            return Err(DomainError::ConcurrencyConflict {
                transaction_id: id,
                expected,
                actual,
            });
        }

        state.transactions.insert(id, transaction.clone());
        state.append(record);
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<PaymentTransaction>> {
        Ok(self.state.read().await.transactions.get(&id).cloned())
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>> {
        let state = self.state.read().await;
        let mut stale: Vec<PaymentTransaction> = state
            .transactions
            .values()
            .filter(|tx| !tx.is_terminal() && tx.updated_at() < updated_before)
            .cloned()
            .collect();

        stale.sort_by_key(|tx| tx.updated_at());
        stale.truncate(limit);
        Ok(stale)
    }

    async fn audit_trail(&self, id: TransactionId) -> Result<Vec<AuditRecord>> {
        Ok(self
            .state
            .read()
            .await
            .audit
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl OutboxStore for InMemoryTransactionStore {
    async fn pending(&self, limit: usize, now: DateTime<Utc>) -> event_bus::Result<Vec<OutboxEntry>> {
        Ok(self.state.read().await.outbox.pending(limit, now))
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> event_bus::Result<()> {
        self.state.write().await.outbox.mark_published(id, at)
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> event_bus::Result<()> {
        self.state
            .write()
            .await
            .outbox
            .mark_retry(id, attempts, next_attempt_at, error)
    }
}
