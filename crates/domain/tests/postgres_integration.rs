//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need Docker, so they are
//! ignored by default. Run with:
//!
//! ```bash
//! cargo test -p domain --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{Currency, IdempotencyKey, Money, TransactionId};
use domain::{
    DomainError, FailureReason, IdempotencyStore, OutcomeSnapshot, PaymentTransaction,
    PostgresIdempotencyStore, PostgresTransactionStore, Reservation, TransactionStatus,
    TransactionStore, TransitionRecord,
};
use event_bus::{OutboxStore, PostgresOutbox};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
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

/// Fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE transaction_audit, outbox, payment_transactions, idempotency_records",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

fn new_transaction(key: &str) -> (PaymentTransaction, TransitionRecord) {
    let (tx, transition) = PaymentTransaction::create(
        TransactionId::new(),
        IdempotencyKey::new(key).unwrap(),
        Money::new(5000, Currency::usd()),
        serde_json::json!({"booking_id": "B-42"}),
        "fp",
        Utc::now(),
    )
    .unwrap();
    let record = TransitionRecord::new(&tx, &transition).unwrap();
    (tx, record)
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn create_and_load_transaction() {
    let store = PostgresTransactionStore::new(get_test_pool().await);
    let (tx, record) = new_transaction("pg-1");

    store.create(&tx, record.clone()).await.unwrap();
    let loaded = store.get(tx.id()).await.unwrap().unwrap();
    assert_eq!(loaded, tx);

    let duplicate = store.create(&tx, record).await;
    assert!(matches!(
        duplicate,
        Err(DomainError::DuplicateTransaction(_))
    ));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn commit_writes_audit_and_outbox_atomically() {
    let pool = get_test_pool().await;
    let store = PostgresTransactionStore::new(pool.clone());
    let outbox = PostgresOutbox::new(pool);

    let (tx, record) = new_transaction("pg-2");
    store.create(&tx, record).await.unwrap();

    let mut next = tx.clone();
    let transition = next.start_authorization(Utc::now()).unwrap();
    let record = TransitionRecord::new(&next, &transition).unwrap();
    store.commit(&next, tx.version(), record).await.unwrap();

    let audit = store.audit_trail(tx.id()).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[1].from, Some(TransactionStatus::Created));
    assert_eq!(audit[1].to, TransactionStatus::Authorizing);

    let pending = outbox.pending(10, Utc::now()).await.unwrap();
    let keys: Vec<String> = pending
        .iter()
        .map(|e| e.envelope.delivery_key.to_string())
        .collect();
    assert_eq!(
        keys,
        vec![
            format!("{}:v1:CREATED", tx.id()),
            format!("{}:v2:AUTHORIZING", tx.id())
        ]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn stale_version_conflicts_and_writes_nothing() {
    let pool = get_test_pool().await;
    let store = PostgresTransactionStore::new(pool.clone());
    let outbox = PostgresOutbox::new(pool);

    let (tx, record) = new_transaction("pg-3");
    store.create(&tx, record).await.unwrap();

    let mut winner = tx.clone();
    let t = winner.start_authorization(Utc::now()).unwrap();
    store
        .commit(&winner, tx.version(), TransitionRecord::new(&winner, &t).unwrap())
        .await
        .unwrap();

    let mut loser = tx.clone();
    let t = loser.start_authorization(Utc::now()).unwrap();
    let result = store
        .commit(&loser, tx.version(), TransitionRecord::new(&loser, &t).unwrap())
        .await;

    assert!(matches!(result, Err(DomainError::ConcurrencyConflict { .. })));
    assert_eq!(store.audit_trail(tx.id()).await.unwrap().len(), 2);
    assert_eq!(outbox.pending(10, Utc::now()).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn outbox_retry_blocks_later_entries() {
    let pool = get_test_pool().await;
    let store = PostgresTransactionStore::new(pool.clone());
    let outbox = PostgresOutbox::new(pool);

    let (tx, record) = new_transaction("pg-4");
    store.create(&tx, record).await.unwrap();
    let mut next = tx.clone();
    let t = next.start_authorization(Utc::now()).unwrap();
    store
        .commit(&next, tx.version(), TransitionRecord::new(&next, &t).unwrap())
        .await
        .unwrap();

    let now = Utc::now();
    let first = outbox.pending(10, now).await.unwrap()[0].id;
    outbox
        .mark_retry(first, 1, now + Duration::seconds(60), "bus down")
        .await
        .unwrap();

    assert!(outbox.pending(10, now).await.unwrap().is_empty());
    assert_eq!(
        outbox
            .pending(10, now + Duration::seconds(61))
            .await
            .unwrap()
            .len(),
        2
    );

    outbox.mark_published(first, now).await.unwrap();
    let rest = outbox.pending(10, now).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].envelope.status, "AUTHORIZING");
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn find_stale_excludes_terminal() {
    let store = PostgresTransactionStore::new(get_test_pool().await);

    let (open, record) = new_transaction("pg-open");
    store.create(&open, record).await.unwrap();

    let (tx, record) = new_transaction("pg-declined");
    store.create(&tx, record).await.unwrap();
    let mut declined = tx.clone();
    let now = Utc::now();
    let t = declined.start_authorization(now).unwrap();
    store
        .commit(&declined, tx.version(), TransitionRecord::new(&declined, &t).unwrap())
        .await
        .unwrap();
    let version = declined.version();
    let t = declined
        .record_declined(FailureReason::declined("DO_NOT_HONOR"), 1, now)
        .unwrap();
    store
        .commit(&declined, version, TransitionRecord::new(&declined, &t).unwrap())
        .await
        .unwrap();

    let stale = store
        .find_stale(Utc::now() + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id(), open.id());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn idempotency_reservation_and_conflict() {
    let store = PostgresIdempotencyStore::new(get_test_pool().await);
    let key = IdempotencyKey::new("pg-key").unwrap();
    let now = Utc::now();
    let retention = Duration::hours(24);

    let winner = TransactionId::new();
    let first = store
        .get_or_create(&key, "fp", winner, retention, now)
        .await
        .unwrap();
    assert_eq!(first, Reservation::Reserved { transaction_id: winner });

    let second = store
        .get_or_create(&key, "fp", TransactionId::new(), retention, now)
        .await
        .unwrap();
    assert!(matches!(second, Reservation::Existing(ref r) if r.transaction_id == winner));

    let conflict = store
        .get_or_create(&key, "other", TransactionId::new(), retention, now)
        .await;
    assert!(matches!(conflict, Err(DomainError::IdempotencyConflict { .. })));

    let outcome = OutcomeSnapshot {
        transaction_id: winner,
        status: TransactionStatus::Captured,
        provider_reference: Some("PRV-1".to_string()),
        reason: None,
        attempt_count: 1,
        recorded_at: now,
    };
    store.record_outcome(&key, outcome.clone()).await.unwrap();
    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.outcome, Some(outcome));

    // After expiry the key is reusable for a different request.
    let fresh = TransactionId::new();
    let reused = store
        .get_or_create(&key, "other", fresh, retention, now + retention + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(reused, Reservation::Reserved { transaction_id: fresh });
}
