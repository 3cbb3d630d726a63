//! Outbox relay behaviour against the in-memory outbox and bus.

use chrono::{Duration, Utc};
use event_bus::{
    DeduplicatingConsumer, Delivery, EventBus, EventEnvelope, EventHandler, HandlerError,
    InMemoryDeliveryLedger, InMemoryEventBus, InMemoryOutbox, OutboxRelay, OutboxStore,
    RelayReport, TransactionId, Version,
};
use futures_util::StreamExt;
use std::sync::Mutex;

fn envelope(tx: TransactionId, version: i64, status: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .event_type(format!("Payment{status}"))
        .transaction_id(tx)
        .version(Version::new(version))
        .status(status)
        .payload_raw(serde_json::json!({ "status": status }))
        .try_build()
        .unwrap()
}

#[tokio::test]
async fn relay_publishes_in_insertion_order() {
    let outbox = InMemoryOutbox::new();
    let bus = InMemoryEventBus::new();
    let tx = TransactionId::new();

    for (v, status) in [(1, "CREATED"), (2, "AUTHORIZING"), (3, "AUTHORIZED")] {
        outbox.append(envelope(tx, v, status)).await;
    }

    let relay = OutboxRelay::new(outbox.clone(), bus.clone());
    let report = relay.tick().await.unwrap();

    assert_eq!(
        report,
        RelayReport {
            published: 3,
            failed: 0,
            deferred: 0
        }
    );
    let statuses: Vec<String> = bus.published().into_iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec!["CREATED", "AUTHORIZING", "AUTHORIZED"]);
    assert!(outbox.entries().await.iter().all(|e| e.is_published()));

    // Nothing left to do.
    assert_eq!(relay.tick().await.unwrap(), RelayReport::default());
}

#[tokio::test]
async fn failed_publish_defers_later_events_of_same_transaction() {
    let outbox = InMemoryOutbox::new();
    let bus = InMemoryEventBus::new();
    let tx = TransactionId::new();
    let other = TransactionId::new();

    outbox.append(envelope(tx, 1, "CREATED")).await;
    outbox.append(envelope(tx, 2, "AUTHORIZING")).await;
    outbox.append(envelope(other, 1, "CREATED")).await;

    bus.fail_next_publishes(1);
    let relay = OutboxRelay::new(outbox.clone(), bus.clone());
    let report = relay.tick().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.published, 1);
    assert_eq!(bus.published()[0].transaction_id, other);

    let entries = outbox.entries().await;
    assert_eq!(entries[0].attempts, 1);
    assert!(entries[0].last_error.is_some());
    assert!(entries[0].next_attempt_at > Utc::now());

    // Backoff still running: the transaction stays blocked.
    assert_eq!(
        outbox.pending(10, Utc::now()).await.unwrap().len(),
        0,
        "later entries must wait behind the failed one"
    );

    // Once due, both go out in order.
    let due = outbox.pending(10, Utc::now() + Duration::seconds(5)).await.unwrap();
    let versions: Vec<i64> = due.iter().map(|e| e.envelope.version.as_i64()).collect();
    assert_eq!(versions, vec![1, 2]);
}

struct Recording {
    seen: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl EventHandler for Recording {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .push(event.delivery_key.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn redelivered_events_are_processed_once() {
    let bus = InMemoryEventBus::new();
    let mut stream = bus.subscribe();
    let consumer = DeduplicatingConsumer::new(
        "recording",
        Recording {
            seen: Mutex::new(Vec::new()),
        },
        InMemoryDeliveryLedger::new(),
    );

    let event = envelope(TransactionId::new(), 5, "CAPTURED");
    bus.publish(&event).await.unwrap();
    bus.redeliver_all();

    let first = stream.next().await.unwrap();
    let second = stream.next().await.unwrap();
    assert_eq!(consumer.deliver(&first).await.unwrap(), Delivery::Processed);
    assert_eq!(consumer.deliver(&second).await.unwrap(), Delivery::Duplicate);
    assert_eq!(consumer.handler().seen.lock().unwrap().len(), 1);
}
