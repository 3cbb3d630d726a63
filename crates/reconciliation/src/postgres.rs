use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::Result;
use crate::lease::{Lease, LeaseStore};

/// PostgreSQL-backed lease store over `reconciliation_leases`.
///
/// Acquisition is a single conditional upsert, so two nodes racing for an
/// expired lease cannot both win.
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_lease(row: PgRow) -> Result<Lease> {
        Ok(Lease {
            name: row.try_get("name")?,
            holder: row.try_get("holder")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let row = sqlx::query(
            r#"
            INSERT INTO reconciliation_leases (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE reconciliation_leases.expires_at <= EXCLUDED.acquired_at
                   OR reconciliation_leases.holder = EXCLUDED.holder
            RETURNING name, holder, acquired_at, expires_at
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now + ttl)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_lease).transpose()
    }

    async fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let row = sqlx::query(
            r#"
            UPDATE reconciliation_leases
            SET expires_at = $3
            WHERE name = $1 AND holder = $2 AND expires_at > $4
            RETURNING name, holder, acquired_at, expires_at
            "#,
        )
        .bind(&lease.name)
        .bind(&lease.holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_lease).transpose()
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        sqlx::query("DELETE FROM reconciliation_leases WHERE name = $1 AND holder = $2")
            .bind(&lease.name)
            .bind(&lease.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
