//! Count-based circuit breaker, shared per provider endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{GatewayError, Result};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0..=1.0) at or above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Number of most recent calls considered.
    pub window_size: usize,
    /// Calls required in the window before the rate is evaluated.
    pub minimum_calls: usize,
    /// Time spent open before trial calls are admitted.
    pub cooldown: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_permits: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.4,
            window_size: 5,
            minimum_calls: 3,
            cooldown: Duration::from_secs(20),
            half_open_permits: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub window_calls: usize,
    pub window_failures: usize,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// `true` marks a failed call.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_admitted: u32,
    trials_succeeded: u32,
}

impl Inner {
    fn failures(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.window.len() as f64
        }
    }
}

/// Breaker for one endpoint.
///
/// Closed → Open when at least `minimum_calls` of the last `window_size`
/// calls ran and the failure rate reached the threshold. Open → HalfOpen
/// after `cooldown`. HalfOpen → Closed after `half_open_permits` successful
/// trials, or back to Open on any trial failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trials_admitted: 0,
                trials_succeeded: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Asks for permission to call the provider.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.cooldown);
            if !cooled_down {
                return Err(self.open_error());
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.trials_admitted >= self.config.half_open_permits {
                return Err(self.open_error());
            }
            inner.trials_admitted += 1;
        }

        Ok(())
    }

    /// Records a call that reached the dependency and got a healthy answer.
    pub fn record_success(&self) {
        self.record(false);
    }

    /// Records a call that failed because the dependency is unhealthy.
    pub fn record_failure(&self) {
        self.record(true);
    }

    fn record(&self, failed: bool) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(failed);
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.minimum_calls
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    self.transition(&mut inner, CircuitState::Open);
                } else {
                    inner.trials_succeeded += 1;
                    if inner.trials_succeeded >= self.config.half_open_permits {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            // Result of a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.trials_admitted = 0;
        inner.trials_succeeded = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    endpoint = %self.endpoint,
                    from = from.as_str(),
                    failure_rate = inner.failure_rate(),
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(endpoint = %self.endpoint, "circuit half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
                tracing::info!(endpoint = %self.endpoint, "circuit closed");
            }
        }

        metrics::counter!(
            "circuit_transitions_total",
            "endpoint" => self.endpoint.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn open_error(&self) -> GatewayError {
        GatewayError::CircuitOpen {
            endpoint: self.endpoint.clone(),
        }
    }

    /// Returns the current state.
    ///
    /// An open breaker whose cooldown has elapsed still reports `Open` until
    /// the next call is attempted.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            window_calls: inner.window.len(),
            window_failures: inner.failures(),
            failure_rate: inner.failure_rate(),
        }
    }
}

/// Breakers keyed by endpoint, shared by every caller.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::default(),
        }
    }

    /// Returns the breaker for `endpoint`, creating it on first use.
    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone())))
            .clone()
    }

    /// Snapshots of every known breaker.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.values().map(|b| b.snapshot()).collect()
    }
}
