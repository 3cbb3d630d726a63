//! Transactional outbox contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{EventBusError, EventEnvelope, Result};

/// Upper bound on the publish retry delay.
const MAX_PUBLISH_BACKOFF_SECS: i64 = 300;

/// An event waiting in the outbox, written in the same atomic step as the
/// transition that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic insertion sequence.
    pub id: i64,
    pub envelope: EventEnvelope,
    /// Failed publish attempts so far.
    pub attempts: u32,
    /// Earliest time the relay may try again.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Creates a fresh, immediately publishable entry.
    pub fn new(id: i64, envelope: EventEnvelope) -> Self {
        let next_attempt_at = envelope.occurred_at;
        Self {
            id,
            envelope,
            attempts: 0,
            next_attempt_at,
            last_error: None,
            published_at: None,
        }
    }

    /// Returns true once the bus has acknowledged the entry.
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Read/acknowledge side of the outbox, used by the relay.
///
/// Implementations must only hand out an entry when every earlier entry of
/// the same transaction has been published, so per-transaction delivery
/// order is preserved across retries.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` publishable entries in insertion order.
    async fn pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>>;

    /// Marks an entry as published.
    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Records a failed publish and schedules the next attempt.
    async fn mark_retry(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;
}

/// Delay before retrying a publish that has failed `attempts` times:
/// `min(300, 2^min(attempts, 8))` seconds.
pub fn publish_backoff(attempts: u32) -> Duration {
    let secs = i64::min(MAX_PUBLISH_BACKOFF_SECS, 2_i64.pow(attempts.min(8)));
    Duration::seconds(secs)
}

/// Published entries kept around by default once they are behind the
/// unpublished frontier.
pub const DEFAULT_PUBLISHED_RETENTION: usize = 1024;

/// Insertion-ordered outbox entries with no locking of its own.
///
/// In-memory stores embed this behind the same lock that guards their
/// transaction rows, which is what makes "transition + event" atomic.
///
/// Entries before the first unpublished one are never rescanned, and only
/// the most recent `retention` of them are kept.
#[derive(Debug, Clone)]
pub struct OutboxLog {
    entries: Vec<OutboxEntry>,
    next_id: i64,
    /// Number of leading entries that are all published.
    published_prefix: usize,
    retention: usize,
}

impl Default for OutboxLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_PUBLISHED_RETENTION)
    }
}

impl OutboxLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty log that keeps at most `retention` published entries.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            published_prefix: 0,
            retention,
        }
    }

    /// Appends an envelope and returns its entry id.
    pub fn append(&mut self, envelope: EventEnvelope) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(OutboxEntry::new(id, envelope));
        id
    }

    /// Returns the retained entries: every unpublished one plus recently
    /// published history.
    pub fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    /// Returns up to `limit` publishable entries in insertion order.
    ///
    /// An entry whose retry is not yet due blocks every later entry of the
    /// same transaction.
    pub fn pending(&self, limit: usize, now: DateTime<Utc>) -> Vec<OutboxEntry> {
        let mut blocked = std::collections::HashSet::new();
        let mut selected = Vec::new();

        let unpublished = self.entries[self.published_prefix..]
            .iter()
            .filter(|e| !e.is_published());
        for entry in unpublished {
            let tx = entry.envelope.transaction_id;
            if blocked.contains(&tx) {
                continue;
            }
            if entry.next_attempt_at > now {
                blocked.insert(tx);
                continue;
            }
            selected.push(entry.clone());
            if selected.len() >= limit {
                break;
            }
        }

        selected
    }

    fn entry_mut(&mut self, id: i64) -> Result<&mut OutboxEntry> {
        let index = self
            .entries
            .binary_search_by_key(&id, |e| e.id)
            .map_err(|_| EventBusError::OutboxEntryNotFound(id))?;
        Ok(&mut self.entries[index])
    }

    fn compact(&mut self) {
        while self
            .entries
            .get(self.published_prefix)
            .is_some_and(OutboxEntry::is_published)
        {
            self.published_prefix += 1;
        }

        // Drained in batches of `retention`.
        if self.published_prefix >= self.retention.saturating_mul(2).max(1) {
            let dropped = self.published_prefix - self.retention;
            self.entries.drain(..dropped);
            self.published_prefix = self.retention;
        }
    }

    /// Marks an entry as published.
    pub fn mark_published(&mut self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.entry_mut(id)?.published_at = Some(at);
        self.compact();
        Ok(())
    }

    /// Records a failed publish.
    pub fn mark_retry(
        &mut self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.attempts = attempts;
        entry.next_attempt_at = next_attempt_at;
        entry.last_error = Some(error.to_string());
        Ok(())
    }
}

/// Standalone in-memory outbox.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    log: Arc<Mutex<OutboxLog>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an envelope and returns its entry id.
    pub async fn append(&self, envelope: EventEnvelope) -> i64 {
        self.log.lock().await.append(envelope)
    }

    /// Returns a copy of every entry.
    pub async fn entries(&self) -> Vec<OutboxEntry> {
        self.log.lock().await.entries().to_vec()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        Ok(self.log.lock().await.pending(limit, now))
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.log.lock().await.mark_published(id, at)
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.log
            .lock()
            .await
            .mark_retry(id, attempts, next_attempt_at, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransactionId, Version};

    fn envelope(tx: TransactionId, version: i64) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type("PaymentTest")
            .transaction_id(tx)
            .version(Version::new(version))
            .status("CREATED")
            .payload_raw(serde_json::json!({}))
            .try_build()
            .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(publish_backoff(0), Duration::seconds(1));
        assert_eq!(publish_backoff(1), Duration::seconds(2));
        assert_eq!(publish_backoff(5), Duration::seconds(32));
        assert_eq!(publish_backoff(8), Duration::seconds(256));
        assert_eq!(publish_backoff(20), Duration::seconds(256));
    }

    #[test]
    fn pending_skips_published_entries() {
        let tx = TransactionId::new();
        let mut log = OutboxLog::new();
        let first = log.append(envelope(tx, 1));
        let second = log.append(envelope(tx, 2));
        log.mark_published(first, Utc::now()).unwrap();

        let pending = log.pending(10, Utc::now());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
    }

    #[test]
    fn pending_blocks_later_entries_of_a_delayed_transaction() {
        let tx = TransactionId::new();
        let other = TransactionId::new();

        let mut log = OutboxLog::new();
        let delayed = log.append(envelope(tx, 1));
        log.append(envelope(tx, 2));
        let unrelated = log.append(envelope(other, 1));
        let now = Utc::now();
        log.mark_retry(delayed, 1, now + Duration::seconds(30), "bus down")
            .unwrap();

        let ids: Vec<i64> = log.pending(10, now).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![unrelated]);

        let later: Vec<i64> = log
            .pending(10, now + Duration::seconds(31))
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(later, vec![delayed, delayed + 1, unrelated]);
    }

    #[test]
    fn pending_respects_limit() {
        let tx = TransactionId::new();
        let mut log = OutboxLog::new();
        for v in 1..=5 {
            log.append(envelope(tx, v));
        }
        let pending = log.pending(2, Utc::now());
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].id, 2);
    }

    #[test]
    fn published_history_is_compacted() {
        let tx = TransactionId::new();
        let mut log = OutboxLog::with_retention(2);
        let ids: Vec<i64> = (1..=6).map(|v| log.append(envelope(tx, v))).collect();

        for id in &ids[..5] {
            log.mark_published(*id, Utc::now()).unwrap();
        }

        let kept: Vec<i64> = log.entries().iter().map(|e| e.id).collect();
        assert_eq!(kept, vec![3, 4, 5, 6]);
        let pending = log.pending(10, Utc::now());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 6);

        // Ids keep counting past dropped entries.
        assert_eq!(log.append(envelope(tx, 7)), 7);
        log.mark_published(6, Utc::now()).unwrap();
        assert_eq!(log.pending(10, Utc::now())[0].id, 7);
    }

    #[test]
    fn published_entries_out_of_order_keep_the_gap_pending() {
        let tx = TransactionId::new();
        let other = TransactionId::new();
        let mut log = OutboxLog::with_retention(0);
        let first = log.append(envelope(tx, 1));
        let second = log.append(envelope(other, 1));

        log.mark_published(second, Utc::now()).unwrap();
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.pending(10, Utc::now())[0].id, first);

        log.mark_published(first, Utc::now()).unwrap();
        assert!(log.entries().is_empty());
        assert!(log.pending(10, Utc::now()).is_empty());
    }

    #[test]
    fn unknown_entry_is_reported() {
        let mut log = OutboxLog::new();
        assert!(matches!(
            log.mark_published(42, Utc::now()),
            Err(EventBusError::OutboxEntryNotFound(42))
        ));
    }
}
