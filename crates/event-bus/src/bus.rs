//! Event bus contract and in-memory implementation.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::{EventBusError, EventEnvelope, Result};

/// A stream of delivered events.
pub type EventStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>;

/// Durable publication of domain events.
///
/// `publish` returns only after the bus has durably accepted the event.
/// Delivery to consumers is at-least-once: the same envelope may be
/// delivered more than once and consumers deduplicate by delivery key.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &EventEnvelope) -> Result<()>;
}

/// Accepted events the in-memory bus remembers by default.
pub const DEFAULT_BUS_HISTORY: usize = 1024;

struct BusState {
    published: VecDeque<EventEnvelope>,
    accepted: usize,
    history: usize,
    subscribers: Vec<mpsc::UnboundedSender<EventEnvelope>>,
    failures_remaining: u32,
}

/// In-process bus that fans every published event out to all subscribers.
///
/// Keeps a bounded log of the events it accepted and can be told to fail
/// the next `n` publishes, which is how relay retry behaviour is exercised.
#[derive(Clone)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::with_history(DEFAULT_BUS_HISTORY)
    }
}

impl InMemoryEventBus {
    /// Creates a new empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus that remembers the last `history` accepted events.
    pub fn with_history(history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                published: VecDeque::new(),
                accepted: 0,
                history,
                subscribers: Vec::new(),
                failures_remaining: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to every event published from now on.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);

        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Returns the remembered events, in acceptance order.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.lock().published.iter().cloned().collect()
    }

    /// Returns the number of events accepted over the bus lifetime.
    pub fn published_count(&self) -> usize {
        self.lock().accepted
    }

    /// Delivers every remembered event to all subscribers again, as a broker
    /// would after a consumer group rebalance.
    pub fn redeliver_all(&self) {
        let mut state = self.lock();
        let events = state.published.clone();
        state
            .subscribers
            .retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &EventEnvelope) -> Result<()> {
        let mut state = self.lock();

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(EventBusError::PublishFailed {
                delivery_key: event.delivery_key.clone(),
                reason: "bus unavailable".to_string(),
            });
        }

        state.accepted += 1;
        state.published.push_back(event.clone());
        while state.published.len() > state.history {
            state.published.pop_front();
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransactionId, Version};
    use futures_util::StreamExt;

    fn event(tx: TransactionId, version: i64, status: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type("PaymentTest")
            .transaction_id(tx)
            .version(Version::new(version))
            .status(status)
            .payload_raw(serde_json::json!({}))
            .try_build()
            .unwrap()
    }

    #[tokio::test]
    async fn publish_fans_out_to_subscribers() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let e = event(TransactionId::new(), 1, "CREATED");
        bus.publish(&e).await.unwrap();

        assert_eq!(a.next().await.unwrap(), e);
        assert_eq!(b.next().await.unwrap(), e);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_reject_publishes() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        let e = event(TransactionId::new(), 1, "CREATED");
        assert!(matches!(
            bus.publish(&e).await,
            Err(EventBusError::PublishFailed { .. })
        ));
        assert_eq!(bus.published_count(), 0);

        bus.publish(&e).await.unwrap();
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn redeliver_all_repeats_events() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe();
        let e = event(TransactionId::new(), 1, "CREATED");
        bus.publish(&e).await.unwrap();
        bus.redeliver_all();

        assert_eq!(sub.next().await.unwrap(), e);
        assert_eq!(sub.next().await.unwrap(), e);
    }

    #[tokio::test]
    async fn history_keeps_latest_events() {
        let bus = InMemoryEventBus::with_history(2);
        let tx = TransactionId::new();
        for (v, status) in [(1, "CREATED"), (2, "AUTHORIZING"), (3, "AUTHORIZED")] {
            bus.publish(&event(tx, v, status)).await.unwrap();
        }

        let statuses: Vec<String> = bus.published().into_iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec!["AUTHORIZING", "AUTHORIZED"]);
        assert_eq!(bus.published_count(), 3);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        drop(sub);

        bus.publish(&event(TransactionId::new(), 1, "CREATED"))
            .await
            .unwrap();
        assert!(bus.lock().subscribers.is_empty());
    }
}
