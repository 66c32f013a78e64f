//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` that tunes the orchestration
//! engine: concurrency, default retry policy, circuit breaker thresholds,
//! stale-execution reaping, and chain depth. All fields have defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level engine configuration.
///
/// Loaded from `~/.taskweave/config.toml` (or `--config`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum tasks running at once within a single execution.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retry policy for tasks that do not declare their own.
    #[serde(default)]
    pub default_retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Running executions with no update for this long are reaped.
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,

    /// How often the background reaper looks for stale executions.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Chained executions deeper than this are not started.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,

    /// Per-invocation timeout for tasks that do not declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_stale_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 1000
}

fn default_max_chain_depth() -> u32 {
    5
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            stale_timeout_ms: default_stale_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_chain_depth: default_max_chain_depth(),
            task_timeout_ms: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Thresholds for the per-capability circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful half-open trials needed to close it again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time the circuit stays open before a trial is allowed.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.default_retry.max_retries, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.stale_timeout(), Duration::from_secs(1800));
        assert_eq!(config.max_chain_depth, 5);
        assert!(config.task_timeout_ms.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
max_concurrency = 2

[circuit_breaker]
failure_threshold = 3
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.default_retry.base_delay_ms, 500);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_empty_toml_equals_default() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
