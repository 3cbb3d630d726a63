//! Stable, user-visible failure reason codes.

use serde::{Deserialize, Serialize};

pub const PROVIDER_TIMEOUT: &str = "PROVIDER_TIMEOUT";
pub const PROVIDER_UNAVAILABLE: &str = "PROVIDER_UNAVAILABLE";
pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
pub const SETTLEMENT_PENDING: &str = "SETTLEMENT_PENDING";
pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
pub const ATTEMPTS_EXHAUSTED: &str = "ATTEMPTS_EXHAUSTED";

/// Why a transaction failed, or why its last attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: String,
    pub retryable: bool,
}

impl FailureReason {
    fn transient(code: &str) -> Self {
        Self {
            code: code.to_string(),
            retryable: true,
        }
    }

    fn definite(code: String) -> Self {
        Self {
            code,
            retryable: false,
        }
    }

    pub fn provider_timeout() -> Self {
        Self::transient(PROVIDER_TIMEOUT)
    }

    /// Provider answered with a 5xx.
    pub fn provider_unavailable() -> Self {
        Self::transient(PROVIDER_UNAVAILABLE)
    }

    pub fn connection_failed() -> Self {
        Self::transient(CONNECTION_FAILED)
    }

    /// The provider has not confirmed settlement yet.
    pub fn settlement_pending() -> Self {
        Self::transient(SETTLEMENT_PENDING)
    }

    pub fn circuit_open() -> Self {
        Self::transient(CIRCUIT_OPEN)
    }

    pub fn attempts_exhausted() -> Self {
        Self::definite(ATTEMPTS_EXHAUSTED.to_string())
    }

    /// Explicit decline with the provider's decline code.
    pub fn declined(code: &str) -> Self {
        Self::definite(format!("DECLINED:{}", code.to_ascii_uppercase()))
    }

    /// Settlement rejected by the provider after the charge was accepted.
    pub fn rejected(code: &str) -> Self {
        Self::definite(format!("REJECTED:{}", code.to_ascii_uppercase()))
    }

    /// The provider refused the request as malformed.
    pub fn invalid_request(code: &str) -> Self {
        Self::definite(format!("INVALID_REQUEST:{}", code.to_ascii_uppercase()))
    }

    /// Any other provider error code, with its classification.
    pub fn provider_error(code: &str, retryable: bool) -> Self {
        Self {
            code: format!("PROVIDER_ERROR:{}", code.to_ascii_uppercase()),
            retryable,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(FailureReason::provider_timeout().code, "PROVIDER_TIMEOUT");
        assert_eq!(FailureReason::declined("do_not_honor").code, "DECLINED:DO_NOT_HONOR");
        assert_eq!(FailureReason::rejected("REJECTED").code, "REJECTED:REJECTED");
        assert_eq!(
            FailureReason::invalid_request("INVALID_AMOUNT").code,
            "INVALID_REQUEST:INVALID_AMOUNT"
        );
        assert_eq!(
            FailureReason::provider_error("weird", true).code,
            "PROVIDER_ERROR:WEIRD"
        );
    }

    #[test]
    fn test_retryable_flags() {
        assert!(FailureReason::circuit_open().retryable);
        assert!(FailureReason::settlement_pending().retryable);
        assert!(!FailureReason::attempts_exhausted().retryable);
        assert!(!FailureReason::declined("X").retryable);
    }
}
