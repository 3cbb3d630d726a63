//! HTTP boundary and process wiring for the payment orchestrator.
//!
//! Exposes payment submission, status, advance and refund endpoints, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod consumers;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use domain::{IdempotencyStore, InMemoryIdempotencyStore, InMemoryTransactionStore, TransactionStore};
use event_bus::InMemoryEventBus;
use gateway::{CircuitBreakerRegistry, PaymentGateway, ResilientGateway, SimulatedGateway};
use metrics_exporter_prometheus::PrometheusHandle;
use payments::{Orchestrator, TransactionStateMachine};
use reconciliation::InMemoryLeaseStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S, I, G> {
    pub orchestrator: Orchestrator<S, I, G>,
    /// How long `POST /payments` waits before answering 202.
    pub submit_wait: Duration,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, I, G>(state: Arc<AppState<S, I, G>>, metrics_handle: PrometheusHandle) -> Router
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S, I, G>))
        .route("/payments", post(routes::payments::create::<S, I, G>))
        .route("/payments/{id}", get(routes::payments::get::<S, I, G>))
        .route(
            "/payments/{id}/advance",
            post(routes::payments::advance::<S, I, G>),
        )
        .route(
            "/payments/{id}/refund",
            post(routes::payments::refund::<S, I, G>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

pub type InMemoryMachine =
    TransactionStateMachine<InMemoryTransactionStore, InMemoryIdempotencyStore, SimulatedGateway>;

pub type InMemoryState = AppState<InMemoryTransactionStore, InMemoryIdempotencyStore, SimulatedGateway>;

/// Single-node wiring: in-memory stores, bus and leases in front of the
/// simulated provider.
pub struct InMemoryServices {
    pub state: Arc<InMemoryState>,
    pub store: InMemoryTransactionStore,
    pub bus: InMemoryEventBus,
    pub leases: InMemoryLeaseStore,
    pub provider: SimulatedGateway,
}

impl InMemoryServices {
    pub fn new(config: &Config) -> Self {
        Self::with_provider(config, SimulatedGateway::new("simulated-provider"))
    }

    /// Wires everything around an existing provider, e.g. one with scripted
    /// responses.
    pub fn with_provider(config: &Config, provider: SimulatedGateway) -> Self {
        let store = InMemoryTransactionStore::new();
        let gateway = ResilientGateway::new(
            provider.clone(),
            &CircuitBreakerRegistry::default(),
            config.resilience(),
        );
        let machine = TransactionStateMachine::new(
            store.clone(),
            InMemoryIdempotencyStore::new(),
            gateway,
            config.machine(),
        );
        let state = Arc::new(AppState {
            orchestrator: Orchestrator::new(Arc::new(machine), config.orchestrator()),
            submit_wait: config.submit_wait,
        });

        Self {
            state,
            store,
            bus: InMemoryEventBus::new(),
            leases: InMemoryLeaseStore::new(),
            provider,
        }
    }

    pub fn machine(&self) -> &Arc<InMemoryMachine> {
        self.state.orchestrator.machine()
    }
}
