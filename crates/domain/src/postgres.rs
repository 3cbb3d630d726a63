use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{IdempotencyKey, TransactionId};
use event_bus::{PostgresOutbox, Version};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::idempotency::{IdempotencyRecord, IdempotencyStore, OutcomeSnapshot, Reservation};
use crate::store::{TransactionStore, TransitionRecord};
use crate::transaction::{PaymentTransaction, TransactionStatus};
use crate::{DomainError, Result};

/// PostgreSQL-backed transaction store.
///
/// Each write runs in one SQL transaction covering `payment_transactions`,
/// `transaction_audit` and `outbox`.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    /// Creates a new PostgreSQL transaction store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    async fn insert_audit(conn: &mut PgConnection, audit: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_audit (transaction_id, version, from_status, to_status,
                                           event_type, reason, attempt_count, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(audit.transaction_id.as_uuid())
        .bind(audit.version.as_i64())
        .bind(audit.from.map(|s| s.as_str()))
        .bind(audit.to.as_str())
        .bind(&audit.event_type)
        .bind(&audit.reason)
        .bind(audit.attempt_count as i32)
        .bind(audit.recorded_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    fn row_to_transaction(row: PgRow) -> Result<PaymentTransaction> {
        let snapshot: serde_json::Value = row.try_get("snapshot")?;
        Ok(serde_json::from_value(snapshot)?)
    }

    fn row_to_audit(row: PgRow) -> Result<AuditRecord> {
        let from: Option<String> = row.try_get("from_status")?;
        let to: String = row.try_get("to_status")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(AuditRecord {
            transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
            version: Version::new(row.try_get("version")?),
            from: from.map(|s| s.parse()).transpose()?,
            to: to.parse()?,
            event_type: row.try_get("event_type")?,
            reason: row.try_get("reason")?,
            attempt_count: attempt_count.max(0) as u32,
            recorded_at: row.try_get("occurred_at")?,
        })
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn create(
        &self,
        transaction: &PaymentTransaction,
        record: TransitionRecord,
    ) -> Result<()> {
        let snapshot = serde_json::to_value(transaction)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payment_transactions (id, idempotency_key, status, version, snapshot,
                                              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transaction.id().as_uuid())
        .bind(transaction.idempotency_key().as_str())
        .bind(transaction.status().as_str())
        .bind(transaction.version().as_i64())
        .bind(snapshot)
        .bind(transaction.created_at())
        .bind(transaction.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("payment_transactions_pkey")
            {
                return DomainError::DuplicateTransaction(transaction.id());
            }
            DomainError::Database(e)
        })?;

        Self::insert_audit(&mut *tx, &record.audit).await?;
        PostgresOutbox::insert(&mut *tx, &record.envelope).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit(
        &self,
        transaction: &PaymentTransaction,
        expected: Version,
        record: TransitionRecord,
    ) -> Result<()> {
        let id = transaction.id();
        let snapshot = serde_json::to_value(transaction)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $3, version = $4, snapshot = $5, updated_at = $6
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_i64())
        .bind(transaction.status().as_str())
        .bind(transaction.version().as_i64())
        .bind(snapshot)
        .bind(transaction.updated_at())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM payment_transactions WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match actual {
                None => DomainError::TransactionNotFound(id),
                Some(actual) => DomainError::ConcurrencyConflict {
                    transaction_id: id,
                    expected,
                    actual: Version::new(actual),
                },
            });
        }

        Self::insert_audit(&mut *tx, &record.audit).await?;
        PostgresOutbox::insert(&mut *tx, &record.envelope).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<PaymentTransaction>> {
        let row = sqlx::query("SELECT snapshot FROM payment_transactions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_transaction).transpose()
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>> {
        let terminal: Vec<&str> = TransactionStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT snapshot FROM payment_transactions
            WHERE status <> ALL($1) AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
        )
        .bind(&terminal)
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_transaction).collect()
    }

    async fn audit_trail(&self, id: TransactionId) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT transaction_id, version, from_status, to_status, event_type, reason,
                   attempt_count, occurred_at
            FROM transaction_audit
            WHERE transaction_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_audit).collect()
    }
}

/// PostgreSQL-backed idempotency store.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: PgRow) -> Result<IdempotencyRecord> {
        let key: String = row.try_get("idempotency_key")?;
        let outcome: Option<serde_json::Value> = row.try_get("outcome")?;

        Ok(IdempotencyRecord {
            key: IdempotencyKey::new(key)?,
            transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
            fingerprint: row.try_get("fingerprint")?,
            outcome: outcome.map(serde_json::from_value).transpose()?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get_or_create(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        candidate: TransactionId,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        // Inserts, or takes over an expired row; a live row is left alone and
        // nothing is returned.
        let reserved: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO idempotency_records (idempotency_key, fingerprint, transaction_id,
                                             outcome, created_at, expires_at)
            VALUES ($1, $2, $3, NULL, $4, $5)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET fingerprint = EXCLUDED.fingerprint,
                transaction_id = EXCLUDED.transaction_id,
                outcome = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.expires_at <= EXCLUDED.created_at
            RETURNING transaction_id
            "#,
        )
        .bind(key.as_str())
        .bind(fingerprint)
        .bind(candidate.as_uuid())
        .bind(now)
        .bind(now + retention)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(transaction_id) = reserved {
            return Ok(Reservation::Reserved {
                transaction_id: TransactionId::from_uuid(transaction_id),
            });
        }

        let existing = self
            .get(key)
            .await?
            .ok_or_else(|| DomainError::IdempotencyRecordNotFound(key.clone()))?;

        if existing.fingerprint != fingerprint {
            return Err(DomainError::IdempotencyConflict { key: key.clone() });
        }
        Ok(Reservation::Existing(existing))
    }

    async fn record_outcome(&self, key: &IdempotencyKey, outcome: OutcomeSnapshot) -> Result<()> {
        let transaction_id = outcome.transaction_id;
        let outcome = serde_json::to_value(&outcome)?;

        let result = sqlx::query(
            r#"
            UPDATE idempotency_records SET outcome = $3
            WHERE idempotency_key = $1 AND transaction_id = $2
            "#,
        )
        .bind(key.as_str())
        .bind(transaction_id.as_uuid())
        .bind(outcome)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(key = %key, %transaction_id, "idempotency key now belongs to another transaction");
        }
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, fingerprint, transaction_id, outcome, created_at, expires_at
            FROM idempotency_records
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }
}
