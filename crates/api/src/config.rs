//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use gateway::{ResilienceConfig, RetryPolicy};
use payments::{OrchestratorConfig, StateMachineConfig};
use reconciliation::SchedulerConfig;

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `PAYMENT_MAX_ATTEMPTS`: provider attempts per transaction (default: `3`)
/// - `GATEWAY_TIMEOUT_MS`: per-call provider timeout (default: `5000`)
/// - `SUBMIT_WAIT_MS`: how long `POST /payments` waits for an outcome (default: `10000`)
/// - `RECONCILE_INTERVAL_SECS`: time between reconciliation cycles (default: `60`)
/// - `RECONCILE_STALENESS_SECS`: idle time before a transaction is resumed (default: `300`)
/// - `RECONCILE_LEASE_TTL_SECS`: reconciliation lease lifetime (default: `30`)
/// - `IDEMPOTENCY_RETENTION_HOURS`: how long idempotency keys stay live (default: `24`)
/// - `NODE_ID`: lease holder identity (default: `"node-<pid>"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub payment_max_attempts: u32,
    pub gateway_timeout: Duration,
    pub submit_wait: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_staleness: Duration,
    pub reconcile_lease_ttl: Duration,
    pub idempotency_retention_hours: i64,
    pub node_id: String,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            payment_max_attempts: env_or("PAYMENT_MAX_ATTEMPTS", defaults.payment_max_attempts),
            gateway_timeout: Duration::from_millis(env_or("GATEWAY_TIMEOUT_MS", 5000)),
            submit_wait: Duration::from_millis(env_or("SUBMIT_WAIT_MS", 10_000)),
            reconcile_interval: Duration::from_secs(env_or("RECONCILE_INTERVAL_SECS", 60)),
            reconcile_staleness: Duration::from_secs(env_or("RECONCILE_STALENESS_SECS", 300)),
            reconcile_lease_ttl: Duration::from_secs(env_or("RECONCILE_LEASE_TTL_SECS", 30)),
            idempotency_retention_hours: env_or(
                "IDEMPOTENCY_RETENTION_HOURS",
                defaults.idempotency_retention_hours,
            ),
            node_id: std::env::var("NODE_ID").unwrap_or(defaults.node_id),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn machine(&self) -> StateMachineConfig {
        StateMachineConfig {
            max_attempts: self.payment_max_attempts,
        }
    }

    /// Provider call policy. A single call may spend the whole attempt
    /// budget of its transaction.
    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig {
            call_timeout: self.gateway_timeout,
            retry: RetryPolicy {
                max_attempts: self.payment_max_attempts,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            idempotency_retention: chrono::Duration::hours(self.idempotency_retention_hours),
            ..OrchestratorConfig::default()
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.reconcile_interval,
            lease_ttl: chrono_duration(self.reconcile_lease_ttl),
            staleness: chrono_duration(self.reconcile_staleness),
            ..SchedulerConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            payment_max_attempts: 3,
            gateway_timeout: Duration::from_secs(5),
            submit_wait: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(60),
            reconcile_staleness: Duration::from_secs(300),
            reconcile_lease_ttl: Duration::from_secs(30),
            idempotency_retention_hours: domain::DEFAULT_RETENTION_HOURS,
            node_id: format!("node-{}", std::process::id()),
        }
    }
}
