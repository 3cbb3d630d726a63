use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    DeliveryKey, DeliveryLedger, DeliveryRecord, DeliveryStatus, EventBusError, EventEnvelope,
    EventId, OutboxEntry, OutboxStore, Result, TransactionId, Version,
};

/// PostgreSQL-backed outbox.
///
/// Rows are inserted by the transaction store inside its own database
/// transaction (see [`PostgresOutbox::insert`]); this type is the relay's
/// read/acknowledge side.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Creates a new PostgreSQL outbox.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts an envelope using the caller's connection, so it commits or
    /// rolls back together with the caller's state change.
    pub async fn insert(conn: &mut PgConnection, envelope: &EventEnvelope) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (event_id, event_type, transaction_id, version, status,
                                delivery_key, occurred_at, payload, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7)
            RETURNING id
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(&envelope.event_type)
        .bind(envelope.transaction_id.as_uuid())
        .bind(envelope.version.as_i64())
        .bind(&envelope.status)
        .bind(envelope.delivery_key.as_str())
        .bind(envelope.occurred_at)
        .bind(&envelope.payload)
        .fetch_one(conn)
        .await?;

        Ok(id)
    }

    fn row_to_entry(row: PgRow) -> Result<OutboxEntry> {
        let attempts: i32 = row.try_get("attempts")?;
        Ok(OutboxEntry {
            id: row.try_get("id")?,
            envelope: EventEnvelope {
                event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
                event_type: row.try_get("event_type")?,
                transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
                version: Version::new(row.try_get("version")?),
                status: row.try_get("status")?,
                delivery_key: DeliveryKey::from_raw(row.try_get::<String, _>("delivery_key")?),
                occurred_at: row.try_get("occurred_at")?,
                payload: row.try_get("payload")?,
            },
            attempts: attempts.max(0) as u32,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        // An entry is only eligible once every earlier unpublished entry of
        // the same transaction is eligible too.
        let rows = sqlx::query(
            r#"
            SELECT o.id, o.event_id, o.event_type, o.transaction_id, o.version, o.status,
                   o.delivery_key, o.occurred_at, o.payload, o.attempts, o.next_attempt_at,
                   o.last_error, o.published_at
            FROM outbox o
            WHERE o.published_at IS NULL
              AND o.next_attempt_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM outbox earlier
                  WHERE earlier.transaction_id = o.transaction_id
                    AND earlier.id < o.id
                    AND earlier.published_at IS NULL
                    AND earlier.next_attempt_at > $1
              )
            ORDER BY o.id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE outbox SET published_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EventBusError::OutboxEntryNotFound(id));
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $2, next_attempt_at = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts as i32)
        .bind(next_attempt_at)
        .bind(crate::truncate_error(error))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EventBusError::OutboxEntryNotFound(id));
        }
        Ok(())
    }
}

/// PostgreSQL-backed delivery ledger, scoped to one consumer name.
#[derive(Clone)]
pub struct PostgresDeliveryLedger {
    pool: PgPool,
    consumer: String,
}

impl PostgresDeliveryLedger {
    pub fn new(pool: PgPool, consumer: impl Into<String>) -> Self {
        Self {
            pool,
            consumer: consumer.into(),
        }
    }
}

#[async_trait]
impl DeliveryLedger for PostgresDeliveryLedger {
    async fn find(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query(
            r#"
            SELECT delivery_key, transaction_id, status, error, processed_at
            FROM processed_deliveries
            WHERE consumer = $1 AND delivery_key = $2
            "#,
        )
        .bind(&self.consumer)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status = match row.try_get::<String, _>("status")?.as_str() {
            "SKIPPED" => DeliveryStatus::Skipped,
            _ => DeliveryStatus::Success,
        };

        Ok(Some(DeliveryRecord {
            delivery_key: DeliveryKey::from_raw(row.try_get::<String, _>("delivery_key")?),
            transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
            status,
            error: row.try_get("error")?,
            processed_at: row.try_get("processed_at")?,
        }))
    }

    async fn record(&self, record: DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_deliveries (consumer, delivery_key, transaction_id, status, error, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (consumer, delivery_key) DO NOTHING
            "#,
        )
        .bind(&self.consumer)
        .bind(record.delivery_key.as_str())
        .bind(record.transaction_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.error)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
