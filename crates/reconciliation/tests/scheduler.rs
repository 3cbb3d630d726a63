//! Reconciliation cycles over in-memory stores, the simulated provider and
//! a shared in-memory lease store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Currency, IdempotencyKey, Money, TransactionId};
use domain::{InMemoryIdempotencyStore, InMemoryTransactionStore, TransactionStatus};
use gateway::{CircuitBreakerRegistry, ResilienceConfig, ResilientGateway, RetryPolicy, SimulatedGateway};
use payments::{PaymentError, StateMachineConfig, TransactionStateMachine};
use reconciliation::{
    CycleReport, InMemoryLeaseStore, Lease, LeaseStore, Reconcilable, ReconciliationError,
    ReconciliationScheduler, Result, SchedulerConfig,
};
use serde_json::json;
use tokio::sync::watch;

type TestMachine =
    TransactionStateMachine<InMemoryTransactionStore, InMemoryIdempotencyStore, SimulatedGateway>;

const LEASE: &str = "payment-reconciliation";

struct TestHarness {
    machine: Arc<TestMachine>,
    provider: SimulatedGateway,
    leases: InMemoryLeaseStore,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_provider(SimulatedGateway::new("sim-provider"))
    }

    fn with_provider(provider: SimulatedGateway) -> Self {
        let gateway = ResilientGateway::new(
            provider.clone(),
            &CircuitBreakerRegistry::default(),
            ResilienceConfig {
                call_timeout: Duration::from_secs(1),
                retry: RetryPolicy::immediate(3),
            },
        );
        let machine = TransactionStateMachine::new(
            InMemoryTransactionStore::new(),
            InMemoryIdempotencyStore::new(),
            gateway,
            StateMachineConfig::default(),
        );

        Self {
            machine: Arc::new(machine),
            provider,
            leases: InMemoryLeaseStore::new(),
        }
    }

    fn scheduler(
        &self,
        node: &str,
        config: SchedulerConfig,
    ) -> ReconciliationScheduler<InMemoryLeaseStore, Arc<TestMachine>> {
        ReconciliationScheduler::new(node, self.leases.clone(), self.machine.clone(), config)
    }

    /// Persists transactions left in `Created`, as if their process died
    /// before driving them.
    async fn abandoned(&self, count: usize) -> Vec<TransactionId> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = TransactionId::new();
            self.machine
                .create(
                    id,
                    IdempotencyKey::new(format!("abandoned-{i}-{id}")).unwrap(),
                    Money::new(5000, Currency::usd()),
                    json!({"booking_id": format!("BK-{i}")}),
                    "fingerprint",
                )
                .await
                .unwrap();
            ids.push(id);
        }
        // Let the clock move past their last update.
        tokio::time::sleep(Duration::from_millis(5)).await;
        ids
    }

    async fn status(&self, id: TransactionId) -> TransactionStatus {
        self.machine.load(id).await.unwrap().status()
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        interval: Duration::from_millis(10),
        staleness: chrono::Duration::zero(),
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn test_cycle_resumes_abandoned_transactions() {
    let h = TestHarness::new();
    let ids = h.abandoned(3).await;

    let report = h.scheduler("node-a", config()).run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Completed {
            advanced: 3,
            failed: 0
        }
    );
    for id in ids {
        assert_eq!(h.status(id).await, TransactionStatus::Captured);
    }
    assert_eq!(h.provider.charge_calls(), 3);
    assert!(h.leases.current(LEASE).await.is_none());
}

#[tokio::test]
async fn test_recently_updated_transactions_are_left_alone() {
    let h = TestHarness::new();
    let ids = h.abandoned(2).await;

    let scheduler = h.scheduler(
        "node-a",
        SchedulerConfig {
            staleness: chrono::Duration::minutes(5),
            ..config()
        },
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Completed {
            advanced: 0,
            failed: 0
        }
    );
    for id in ids {
        assert_eq!(h.status(id).await, TransactionStatus::Created);
    }
    assert_eq!(h.provider.charge_calls(), 0);
}

#[tokio::test]
async fn test_terminal_transactions_are_not_rescanned() {
    let h = TestHarness::new();
    let ids = h.abandoned(2).await;
    h.machine.drive(ids[0]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.scheduler("node-a", config()).run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Completed {
            advanced: 1,
            failed: 0
        }
    );
    assert_eq!(h.provider.charge_calls(), 2);
}

#[tokio::test]
async fn test_lease_held_elsewhere_skips_cycle() {
    let h = TestHarness::new();
    let ids = h.abandoned(2).await;
    h.leases
        .acquire(LEASE, "node-a", chrono::Duration::seconds(30), Utc::now())
        .await
        .unwrap()
        .unwrap();

    let report = h.scheduler("node-b", config()).run_cycle().await.unwrap();

    assert_eq!(report, CycleReport::Skipped);
    for id in ids {
        assert_eq!(h.status(id).await, TransactionStatus::Created);
    }
    assert_eq!(h.provider.charge_calls(), 0);
    assert_eq!(h.leases.current(LEASE).await.unwrap().holder, "node-a");
}

#[tokio::test]
async fn test_racing_schedulers_only_one_does_work() {
    let h = TestHarness::with_provider(
        SimulatedGateway::new("sim-provider").with_latency(Duration::from_millis(20)),
    );
    h.abandoned(3).await;

    let a = h.scheduler("node-a", config());
    let b = h.scheduler("node-b", config());
    let (first, second) = tokio::join!(a.run_cycle(), b.run_cycle());

    assert_eq!(
        first.unwrap(),
        CycleReport::Completed {
            advanced: 3,
            failed: 0
        }
    );
    assert_eq!(second.unwrap(), CycleReport::Skipped);
    assert_eq!(h.provider.charge_calls(), 3);
}

/// Lease store whose renewals always find the lease gone.
#[derive(Clone, Default)]
struct LosingLeaseStore {
    inner: InMemoryLeaseStore,
}

#[async_trait]
impl LeaseStore for LosingLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        self.inner.acquire(name, holder, ttl, now).await
    }

    async fn renew(
        &self,
        _lease: &Lease,
        _ttl: chrono::Duration,
        _now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        Ok(None)
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.inner.release(lease).await
    }
}

#[tokio::test]
async fn test_lost_lease_aborts_remaining_work() {
    let h = TestHarness::new();
    let ids = h.abandoned(3).await;

    let scheduler = ReconciliationScheduler::new(
        "node-a",
        LosingLeaseStore::default(),
        h.machine.clone(),
        SchedulerConfig {
            renew_every: 1,
            ..config()
        },
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Aborted {
            advanced: 1,
            failed: 0,
            remaining: 2
        }
    );
    assert_eq!(h.status(ids[0]).await, TransactionStatus::Captured);
    assert_eq!(h.status(ids[1]).await, TransactionStatus::Created);
    assert_eq!(h.status(ids[2]).await, TransactionStatus::Created);
}

/// Target that fails to resume selected transactions.
struct FlakyTarget {
    stale: Vec<TransactionId>,
    failing: TransactionId,
    resumed: Mutex<Vec<TransactionId>>,
}

#[async_trait]
impl Reconcilable for FlakyTarget {
    async fn stale(&self, _updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<TransactionId>> {
        Ok(self.stale.iter().copied().take(limit).collect())
    }

    async fn reconcile(&self, id: TransactionId) -> Result<TransactionStatus> {
        self.resumed.lock().unwrap().push(id);
        if id == self.failing {
            return Err(ReconciliationError::Payment(PaymentError::NotFound(id)));
        }
        Ok(TransactionStatus::Captured)
    }
}

#[tokio::test]
async fn test_failed_transaction_does_not_stop_cycle() {
    let stale: Vec<_> = (0..3).map(|_| TransactionId::new()).collect();
    let target = Arc::new(FlakyTarget {
        stale: stale.clone(),
        failing: stale[1],
        resumed: Mutex::new(Vec::new()),
    });

    let scheduler = ReconciliationScheduler::new(
        "node-a",
        InMemoryLeaseStore::new(),
        target.clone(),
        config(),
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Completed {
            advanced: 2,
            failed: 1
        }
    );
    assert_eq!(*target.resumed.lock().unwrap(), stale);
}

/// Target whose every resumption takes `delay`.
struct SlowTarget {
    stale: Vec<TransactionId>,
    delay: Duration,
    finished: Mutex<Vec<TransactionId>>,
}

impl SlowTarget {
    fn new(count: usize, delay: Duration) -> Self {
        Self {
            stale: (0..count).map(|_| TransactionId::new()).collect(),
            delay,
            finished: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Reconcilable for SlowTarget {
    async fn stale(&self, _updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<TransactionId>> {
        Ok(self.stale.iter().copied().take(limit).collect())
    }

    async fn reconcile(&self, id: TransactionId) -> Result<TransactionStatus> {
        tokio::time::sleep(self.delay).await;
        self.finished.lock().unwrap().push(id);
        Ok(TransactionStatus::Captured)
    }
}

#[tokio::test]
async fn test_long_cycle_keeps_lease_alive() {
    let leases = InMemoryLeaseStore::new();
    let target = Arc::new(SlowTarget::new(10, Duration::from_millis(60)));
    let config = SchedulerConfig {
        lease_ttl: chrono::Duration::milliseconds(200),
        ..config()
    };
    let a = ReconciliationScheduler::new("node-a", leases.clone(), target.clone(), config.clone());
    let b = ReconciliationScheduler::new("node-b", leases.clone(), target.clone(), config);

    let (report_a, report_b) = tokio::join!(a.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        b.run_cycle().await
    });

    assert_eq!(
        report_a.unwrap(),
        CycleReport::Completed {
            advanced: 10,
            failed: 0
        }
    );
    assert_eq!(report_b.unwrap(), CycleReport::Skipped);
    assert_eq!(*target.finished.lock().unwrap(), target.stale);
}

#[tokio::test]
async fn test_transaction_outliving_lease_aborts_cycle() {
    let leases = InMemoryLeaseStore::new();
    let target = Arc::new(SlowTarget::new(2, Duration::from_millis(300)));
    let scheduler = ReconciliationScheduler::new(
        "node-a",
        leases.clone(),
        target.clone(),
        SchedulerConfig {
            lease_ttl: chrono::Duration::milliseconds(100),
            ..config()
        },
    );

    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Aborted {
            advanced: 0,
            failed: 0,
            remaining: 2
        }
    );
    assert!(target.finished.lock().unwrap().is_empty());

    // The expired lease is free for the next node.
    let taken = leases
        .acquire(LEASE, "node-b", chrono::Duration::seconds(1), Utc::now())
        .await
        .unwrap();
    assert!(taken.is_some());
}

#[tokio::test]
async fn test_batch_limit_caps_cycle() {
    let h = TestHarness::new();
    h.abandoned(3).await;

    let scheduler = h.scheduler(
        "node-a",
        SchedulerConfig {
            batch_limit: 2,
            ..config()
        },
    );

    assert_eq!(
        scheduler.run_cycle().await.unwrap(),
        CycleReport::Completed {
            advanced: 2,
            failed: 0
        }
    );
    assert_eq!(
        scheduler.run_cycle().await.unwrap(),
        CycleReport::Completed {
            advanced: 1,
            failed: 0
        }
    );
}

#[tokio::test]
async fn test_run_loop_resumes_until_shutdown() {
    let h = TestHarness::new();
    let ids = h.abandoned(2).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.scheduler("node-a", config()).run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    for id in ids {
        assert_eq!(h.status(id).await, TransactionStatus::Captured);
    }
    assert_eq!(h.provider.charge_calls(), 2);
}
