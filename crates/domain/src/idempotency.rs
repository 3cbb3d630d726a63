//! Idempotency Store: maps an idempotency key to the transaction it created
//! and, once known, that transaction's terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{IdempotencyKey, Money, TransactionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::transaction::{FailureReason, PaymentTransaction, TransactionStatus};
use crate::{DomainError, Result};

/// Default time a key stays reserved.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Prefix of keys derived from request content.
pub const DERIVED_KEY_PREFIX: &str = "drv-";

/// Terminal outcome recorded for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSnapshot {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub provider_reference: Option<String>,
    pub reason: Option<FailureReason>,
    pub attempt_count: u32,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeSnapshot {
    /// Captures the current state of `transaction`.
    pub fn of(transaction: &PaymentTransaction, recorded_at: DateTime<Utc>) -> Self {
        let reason = match transaction.status() {
            TransactionStatus::Captured | TransactionStatus::Refunded => None,
            _ => transaction.last_error().cloned(),
        };

        Self {
            transaction_id: transaction.id(),
            status: transaction.status(),
            provider_reference: transaction.provider_reference().map(str::to_string),
            reason,
            attempt_count: transaction.attempt_count(),
            recorded_at,
        }
    }
}

/// A reserved idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub transaction_id: TransactionId,
    pub fingerprint: String,
    pub outcome: Option<OutcomeSnapshot>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Returns true once the retention window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of [`IdempotencyStore::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller won the key and must create `transaction_id`.
    Reserved { transaction_id: TransactionId },
    /// The key is live for the same request.
    Existing(IdempotencyRecord),
}

/// Durable idempotency key reservations.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically reserves `key` for `candidate`, or returns the live record.
    ///
    /// An expired record is replaced as if absent. A live record with a
    /// different fingerprint fails with [`DomainError::IdempotencyConflict`].
    async fn get_or_create(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        candidate: TransactionId,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    /// Stores the terminal outcome for `key`.
    async fn record_outcome(&self, key: &IdempotencyKey, outcome: OutcomeSnapshot) -> Result<()>;

    /// Loads the record for `key`, expired or not.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;
}

/// In-memory idempotency store.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get_or_create(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        candidate: TransactionId,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(key)
            && !existing.is_expired(now)
        {
            if existing.fingerprint != fingerprint {
                return Err(DomainError::IdempotencyConflict { key: key.clone() });
            }
            return Ok(Reservation::Existing(existing.clone()));
        }

        records.insert(
            key.clone(),
            IdempotencyRecord {
                key: key.clone(),
                transaction_id: candidate,
                fingerprint: fingerprint.to_string(),
                outcome: None,
                created_at: now,
                expires_at: now + retention,
            },
        );

        Ok(Reservation::Reserved {
            transaction_id: candidate,
        })
    }

    async fn record_outcome(&self, key: &IdempotencyKey, outcome: OutcomeSnapshot) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| DomainError::IdempotencyRecordNotFound(key.clone()))?;

        // A reused key must not receive the previous transaction's outcome.
        if record.transaction_id == outcome.transaction_id {
            record.outcome = Some(outcome);
        }
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    amount: i64,
    currency: &'a str,
    payload: &'a serde_json::Value,
}

fn digest(amount: &Money, payload: &serde_json::Value) -> Result<String> {
    // serde_json::Value keeps object keys sorted, which makes this canonical.
    let canonical = serde_json::to_vec(&FingerprintInput {
        amount: amount.minor_units(),
        currency: amount.currency().as_str(),
        payload,
    })?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// SHA-256 hex fingerprint of a payment request's content.
pub fn fingerprint(amount: &Money, payload: &serde_json::Value) -> Result<String> {
    digest(amount, payload)
}

/// Deterministic key for a request submitted without one.
pub fn derive_key(amount: &Money, payload: &serde_json::Value) -> Result<IdempotencyKey> {
    let key = format!("{DERIVED_KEY_PREFIX}{}", digest(amount, payload)?);
    Ok(IdempotencyKey::new(key)?)
}
