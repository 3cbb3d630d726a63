//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use domain::{IdempotencyStore, TransactionStore};
use gateway::{CircuitSnapshot, CircuitState, PaymentGateway};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: CircuitSnapshot,
}

/// GET /health: process status plus the provider circuit.
///
/// Reports `"degraded"` while the circuit is open; the process still serves
/// reads and replays.
pub async fn check<S, I, G>(State(state): State<Arc<AppState<S, I, G>>>) -> Json<HealthResponse>
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    let provider = state.orchestrator.machine().gateway().breaker().snapshot();
    let status = match provider.state {
        CircuitState::Open => "degraded",
        CircuitState::Closed | CircuitState::HalfOpen => "ok",
    };
    Json(HealthResponse { status, provider })
}
