use std::sync::Arc;
use std::time::Duration;

use common::{Currency, IdempotencyKey, Money, TransactionId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{InMemoryIdempotencyStore, InMemoryTransactionStore};
use gateway::{
    CircuitBreakerRegistry, ResilienceConfig, ResilientGateway, RetryPolicy, SimulatedGateway,
};
use payments::{
    Orchestrator, OrchestratorConfig, PaymentRequest, StateMachineConfig, SubmitMode,
    TransactionStateMachine,
};

type BenchMachine =
    TransactionStateMachine<InMemoryTransactionStore, InMemoryIdempotencyStore, SimulatedGateway>;

fn machine() -> BenchMachine {
    TransactionStateMachine::new(
        InMemoryTransactionStore::new(),
        InMemoryIdempotencyStore::new(),
        ResilientGateway::new(
            SimulatedGateway::new("bench"),
            &CircuitBreakerRegistry::default(),
            ResilienceConfig {
                call_timeout: Duration::from_secs(1),
                retry: RetryPolicy::immediate(3),
            },
        ),
        StateMachineConfig::default(),
    )
}

fn bench_drive_to_captured(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let machine = machine();

    c.bench_function("payments/drive_to_captured", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = TransactionId::new();
                machine
                    .create(
                        id,
                        IdempotencyKey::new(id.to_string()).unwrap(),
                        Money::new(5000, Currency::usd()),
                        serde_json::json!({"booking_id": "BK-BENCH"}),
                        "bench",
                    )
                    .await
                    .unwrap();
                machine.drive(id).await.unwrap();
            });
        });
    });
}

fn bench_replayed_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = Orchestrator::new(Arc::new(machine()), OrchestratorConfig::default());
    let request = PaymentRequest {
        idempotency_key: Some(IdempotencyKey::new("bench-replay").unwrap()),
        amount: Money::new(5000, Currency::usd()),
        payload: serde_json::json!({"booking_id": "BK-BENCH"}),
    };
    let wait = SubmitMode::Wait(Duration::from_secs(5));
    rt.block_on(orchestrator.submit(request.clone(), wait))
        .unwrap();

    c.bench_function("payments/replayed_submit", |b| {
        b.iter(|| {
            rt.block_on(async {
                orchestrator.submit(request.clone(), wait).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_drive_to_captured, bench_replayed_submit);
criterion_main!(benches);
