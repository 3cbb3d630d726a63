//! Payment submission, status and refund endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{Currency, IdempotencyKey, Money, TransactionId};
use domain::{IdempotencyStore, TransactionStore};
use gateway::PaymentGateway;
use payments::{PaymentOutcome, PaymentRequest, SubmitMode};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

/// Header consulted when the body carries no idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub idempotency_key: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /payments: submit a payment and wait briefly for its outcome.
///
/// 201 once the transaction has settled (captured, declined or failed),
/// 202 if it is still being processed.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create<S, I, G>(
    State(state): State<Arc<AppState<S, I, G>>>,
    headers: HeaderMap,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentOutcome>), ApiError>
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    let key = req.idempotency_key.or_else(|| {
        headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let idempotency_key = key
        .map(IdempotencyKey::new)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let currency = Currency::new(&req.currency).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let request = PaymentRequest {
        idempotency_key,
        amount: Money::new(req.amount_minor, currency),
        payload: req.payload,
    };
    let outcome = state
        .orchestrator
        .submit(request, SubmitMode::Wait(state.submit_wait))
        .await?;

    let status = if outcome.in_flight {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

/// GET /payments/{id}: current state of a payment.
#[tracing::instrument(skip(state))]
pub async fn get<S, I, G>(
    State(state): State<Arc<AppState<S, I, G>>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentOutcome>, ApiError>
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    let id = parse_transaction_id(&id)?;
    Ok(Json(state.orchestrator.status(id).await?))
}

/// POST /payments/{id}/advance: run one engine step now.
#[tracing::instrument(skip(state))]
pub async fn advance<S, I, G>(
    State(state): State<Arc<AppState<S, I, G>>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentOutcome>, ApiError>
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    let id = parse_transaction_id(&id)?;
    Ok(Json(state.orchestrator.advance(id).await?))
}

/// POST /payments/{id}/refund: refund a captured payment.
#[tracing::instrument(skip(state))]
pub async fn refund<S, I, G>(
    State(state): State<Arc<AppState<S, I, G>>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentOutcome>, ApiError>
where
    S: TransactionStore + 'static,
    I: IdempotencyStore + 'static,
    G: PaymentGateway + 'static,
{
    let id = parse_transaction_id(&id)?;
    Ok(Json(state.orchestrator.refund(id).await?))
}

fn parse_transaction_id(id: &str) -> Result<TransactionId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid transaction id: {e}")))
}
