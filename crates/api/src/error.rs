//! API error types with HTTP response mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use payments::PaymentError;

/// Seconds a caller is asked to wait after an open-circuit rejection.
pub const RETRY_AFTER_SECS: u64 = 20;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Payment engine error.
    Payment(PaymentError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Payment(err) => payment_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

fn payment_error_to_response(err: PaymentError) -> (StatusCode, String) {
    let status = match &err {
        PaymentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PaymentError::IdempotencyConflict { .. } | PaymentError::InvalidState { .. } => {
            StatusCode::CONFLICT
        }
        PaymentError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
        PaymentError::Domain(DomainError::ConcurrencyConflict { .. }) => StatusCode::CONFLICT,
        PaymentError::Domain(_) => {
            tracing::error!(error = %err, "payment engine failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        ApiError::Payment(err)
    }
}
