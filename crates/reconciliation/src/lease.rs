//! Named, expiring, cluster-wide leases.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::Result;

/// A held lease. Only meaningful until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage for leases shared by every node of a deployment.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes the lease `name` for `holder` until `now + ttl`.
    ///
    /// Succeeds when nobody holds it, the previous lease expired, or
    /// `holder` already holds it. Returns `None` otherwise.
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>>;

    /// Extends a lease the caller still holds. Returns `None` if it expired
    /// or changed hands.
    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>)
    -> Result<Option<Lease>>;

    /// Gives the lease up. A no-op unless the caller still holds it.
    async fn release(&self, lease: &Lease) -> Result<()>;
}

#[async_trait]
impl<L: LeaseStore + ?Sized> LeaseStore for Arc<L> {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        (**self).acquire(name, holder, ttl, now).await
    }

    async fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        (**self).renew(lease, ttl, now).await
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        (**self).release(lease).await
    }
}

/// In-memory lease store. Clones share state, which stands in for a shared
/// database between scheduler instances in one process.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<RwLock<HashMap<String, Lease>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current lease for `name`, expired or not.
    pub async fn current(&self, name: &str) -> Option<Lease> {
        self.leases.read().await.get(name).cloned()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut leases = self.leases.write().await;

        if let Some(existing) = leases.get(name)
            && !existing.is_expired(now)
            && existing.holder != holder
        {
            return Ok(None);
        }

        let lease = Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&lease.name) {
            Some(current) if current.holder == lease.holder && !current.is_expired(now) => {
                current.expires_at = now + ttl;
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.write().await;
        if leases
            .get(&lease.name)
            .is_some_and(|current| current.holder == lease.holder)
        {
            leases.remove(&lease.name);
        }
        Ok(())
    }
}
