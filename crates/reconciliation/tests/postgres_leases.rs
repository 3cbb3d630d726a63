//! PostgreSQL lease store tests
//!
//! These need Docker and are ignored by default. Run with:
//!
//! ```bash
//! cargo test -p reconciliation --test postgres_leases -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use reconciliation::{LeaseStore, PostgresLeaseStore};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const LEASE: &str = "payment-reconciliation";

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_payment_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_store() -> PostgresLeaseStore {
    let info = get_container_info().await;
    let pool = PgPool::connect(&info.connection_string).await.unwrap();
    sqlx::query("TRUNCATE TABLE reconciliation_leases")
        .execute(&pool)
        .await
        .unwrap();
    PostgresLeaseStore::new(pool)
}

fn ttl() -> Duration {
    Duration::seconds(30)
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_only_one_holder_at_a_time() {
    let store = get_store().await;
    let now = Utc::now();

    let lease = store.acquire(LEASE, "node-a", ttl(), now).await.unwrap();
    assert_eq!(lease.unwrap().holder, "node-a");

    let refused = store.acquire(LEASE, "node-b", ttl(), now).await.unwrap();
    assert!(refused.is_none());

    let again = store.acquire(LEASE, "node-a", ttl(), now).await.unwrap();
    assert!(again.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_expired_lease_changes_hands() {
    let store = get_store().await;
    let now = Utc::now();

    let old = store.acquire(LEASE, "node-a", ttl(), now).await.unwrap().unwrap();
    let later = now + Duration::seconds(31);

    let taken = store.acquire(LEASE, "node-b", ttl(), later).await.unwrap().unwrap();
    assert_eq!(taken.holder, "node-b");

    assert!(store.renew(&old, ttl(), later).await.unwrap().is_none());
    store.release(&old).await.unwrap();
    assert!(store.acquire(LEASE, "node-a", ttl(), later).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_renew_and_release() {
    let store = get_store().await;
    let now = Utc::now();

    let lease = store.acquire(LEASE, "node-a", ttl(), now).await.unwrap().unwrap();
    let renewed = store
        .renew(&lease, ttl(), now + Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();
    assert!(renewed.expires_at > lease.expires_at);

    store.release(&renewed).await.unwrap();
    let next = store.acquire(LEASE, "node-b", ttl(), now).await.unwrap();
    assert_eq!(next.unwrap().holder, "node-b");
}
