//! Provider errors and their retry classification.

use thiserror::Error;

/// Errors returned by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// No answer within the per-call timeout.
    #[error("Provider call timed out")]
    Timeout,

    /// Provider answered with a 5xx status.
    #[error("Provider server error (status {status})")]
    ServerError { status: u16 },

    /// Connection refused, reset or dropped.
    #[error("Connection to provider failed: {0}")]
    ConnectionFailed(String),

    /// The provider rejected the request as malformed.
    #[error("Provider rejected request: {code}")]
    Validation { code: String },

    /// Provider-specific error code.
    #[error("Provider error: {code}")]
    Provider { code: String },

    /// The circuit breaker for the endpoint is open; the provider was not
    /// contacted.
    #[error("Circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },
}

/// Result type for provider calls.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Retry class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; safe to retry.
    Retryable,
    /// Retrying could double-charge or cannot succeed.
    NonRetryable,
    /// Unrecognised provider code: retried, bounded by the transaction's
    /// attempt limit.
    Unknown,
    /// Fail fast without retrying.
    CircuitOpen,
}

impl ErrorClass {
    /// Returns true if the resilience wrapper may retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable | ErrorClass::Unknown)
    }
}

const RETRYABLE_PROVIDER_CODES: &[&str] = &[
    "PROCESSING_ERROR",
    "ISSUER_UNAVAILABLE",
    "RATE_LIMITED",
    "TRY_AGAIN",
    "GATEWAY_TIMEOUT",
    "DUPLICATE_IN_PROGRESS",
];

const NON_RETRYABLE_PROVIDER_CODES: &[&str] = &[
    "INVALID_AMOUNT",
    "INVALID_CURRENCY",
    "INVALID_CARD",
    "EXPIRED_CARD",
    "INSUFFICIENT_FUNDS",
    "DO_NOT_HONOR",
    "FRAUD_SUSPECTED",
    "AUTHENTICATION_FAILED",
    "ALREADY_REFUNDED",
];

/// Classifies a provider error code (case-insensitive).
pub fn classify_provider_code(code: &str) -> ErrorClass {
    let matches = |table: &[&str]| table.iter().any(|c| c.eq_ignore_ascii_case(code));

    if matches(RETRYABLE_PROVIDER_CODES) {
        ErrorClass::Retryable
    } else if matches(NON_RETRYABLE_PROVIDER_CODES) {
        ErrorClass::NonRetryable
    } else {
        ErrorClass::Unknown
    }
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Timeout
            | GatewayError::ServerError { .. }
            | GatewayError::ConnectionFailed(_) => ErrorClass::Retryable,
            GatewayError::Validation { .. } => ErrorClass::NonRetryable,
            GatewayError::Provider { code } => classify_provider_code(code),
            GatewayError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Returns true if the error says the dependency is unhealthy, as
    /// opposed to rejecting this particular request.
    pub fn counts_as_failure(&self) -> bool {
        self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert_eq!(GatewayError::Timeout.class(), ErrorClass::Retryable);
        assert_eq!(
            GatewayError::ServerError { status: 503 }.class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            GatewayError::ConnectionFailed("reset".into()).class(),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn validation_and_circuit_open_are_not_retried() {
        let validation = GatewayError::Validation {
            code: "INVALID_AMOUNT".into(),
        };
        assert!(!validation.is_retryable());
        assert!(!validation.counts_as_failure());

        let open = GatewayError::CircuitOpen {
            endpoint: "sim".into(),
        };
        assert_eq!(open.class(), ErrorClass::CircuitOpen);
        assert!(!open.is_retryable());
    }

    #[test]
    fn every_retryable_code_is_classified() {
        for code in RETRYABLE_PROVIDER_CODES {
            assert_eq!(classify_provider_code(code), ErrorClass::Retryable, "{code}");
        }
    }

    #[test]
    fn every_non_retryable_code_is_classified() {
        for code in NON_RETRYABLE_PROVIDER_CODES {
            assert_eq!(
                classify_provider_code(code),
                ErrorClass::NonRetryable,
                "{code}"
            );
            let err = GatewayError::Provider {
                code: code.to_string(),
            };
            assert!(!err.is_retryable(), "{code}");
        }
    }

    #[test]
    fn tables_do_not_overlap() {
        for code in RETRYABLE_PROVIDER_CODES {
            assert!(!NON_RETRYABLE_PROVIDER_CODES.contains(code));
        }
    }

    #[test]
    fn classification_ignores_case() {
        assert_eq!(classify_provider_code("try_again"), ErrorClass::Retryable);
        assert_eq!(classify_provider_code("Do_Not_Honor"), ErrorClass::NonRetryable);
    }

    #[test]
    fn unknown_codes_are_retried() {
        assert_eq!(classify_provider_code("E_MYSTERY"), ErrorClass::Unknown);
        assert!(
            GatewayError::Provider {
                code: "E_MYSTERY".into()
            }
            .is_retryable()
        );
    }
}
