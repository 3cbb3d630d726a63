//! Resilience wrapper around a [`PaymentGateway`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use crate::client::{
    ChargeOutcome, ChargeRequest, PaymentGateway, RefundReceipt, RefundRequest, SettlementStatus,
};
use crate::retry::RetryPolicy;
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Per-call timeout.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a wrapped operation plus the number of calls that reached the
/// provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Applies circuit breaking, a per-call timeout and retry with backoff to
/// every provider call.
pub struct ResilientGateway<G> {
    inner: Arc<G>,
    breaker: Arc<CircuitBreaker>,
    config: ResilienceConfig,
}

impl<G> Clone for ResilientGateway<G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            breaker: self.breaker.clone(),
            config: self.config.clone(),
        }
    }
}

impl<G: PaymentGateway> ResilientGateway<G> {
    /// Wraps `inner`, using the registry's breaker for its endpoint.
    pub fn new(inner: G, registry: &CircuitBreakerRegistry, config: ResilienceConfig) -> Self {
        let breaker = registry.get(inner.endpoint());
        Self {
            inner: Arc::new(inner),
            breaker,
            config,
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Dispatches a charge, making at most `budget` calls.
    pub async fn charge(&self, request: &ChargeRequest, budget: u32) -> Attempted<ChargeOutcome> {
        self.call("charge", budget, move || self.inner.charge(request))
            .await
    }

    /// Queries settlement of an accepted charge, making at most `budget` calls.
    pub async fn settlement_status(
        &self,
        provider_reference: &str,
        budget: u32,
    ) -> Attempted<SettlementStatus> {
        self.call("settlement_status", budget, move || {
            self.inner.settlement_status(provider_reference)
        })
        .await
    }

    /// Dispatches a refund, making at most `budget` calls.
    pub async fn refund(&self, request: &RefundRequest, budget: u32) -> Attempted<RefundReceipt> {
        self.call("refund", budget, move || self.inner.refund(request))
            .await
    }

    /// Runs `op` until it succeeds, fails non-retryably, the breaker rejects
    /// it, or `budget` (capped by the retry policy, at least one) is spent.
    #[tracing::instrument(skip(self, op), fields(endpoint = %self.breaker.endpoint()))]
    async fn call<T, F, Fut>(&self, operation: &'static str, budget: u32, op: F) -> Attempted<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let endpoint = self.breaker.endpoint().to_string();
        let max_attempts = budget.clamp(1, self.config.retry.max_attempts.max(1));
        let mut attempts = 0;

        loop {
            if let Err(e) = self.breaker.try_acquire() {
                metrics::counter!(
                    "gateway_circuit_rejections_total",
                    "endpoint" => endpoint.clone(),
                    "operation" => operation
                )
                .increment(1);
                tracing::warn!(attempts, "circuit open, failing fast");
                return Attempted {
                    result: Err(e),
                    attempts,
                };
            }

            attempts += 1;
            let started = std::time::Instant::now();
            let result = match tokio::time::timeout(self.config.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            };
            metrics::histogram!(
                "gateway_call_duration_seconds",
                "endpoint" => endpoint.clone(),
                "operation" => operation
            )
            .record(started.elapsed().as_secs_f64());

            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) if e.is_retryable() => "retryable_error",
                Err(_) => "error",
            };
            metrics::counter!(
                "gateway_calls_total",
                "endpoint" => endpoint.clone(),
                "operation" => operation,
                "outcome" => outcome
            )
            .increment(1);

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => {
                    if e.counts_as_failure() {
                        self.breaker.record_failure();
                    } else {
                        self.breaker.record_success();
                    }

                    if !e.is_retryable() || attempts >= max_attempts {
                        tracing::debug!(attempts, error = %e, "giving up");
                        return Attempted {
                            result: Err(e),
                            attempts,
                        };
                    }

                    let delay = self.config.retry.backoff(attempts);
                    tracing::warn!(attempts, error = %e, delay_ms = delay.as_millis() as u64, "retrying provider call");
                    metrics::counter!(
                        "gateway_retries_total",
                        "endpoint" => endpoint.clone(),
                        "operation" => operation
                    )
                    .increment(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
