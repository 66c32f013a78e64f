//! Built-in demo capabilities for the `builtin` agent type.
//!
//! Actions:
//! - `echo`: returns its parameters unchanged.
//! - `sleep`: waits `ms` milliseconds, then returns `{ "slept_ms": ms }`.
//! - `fail`: fails with `category` (default `internal`) and `message`.
//! - `flaky`: fails with `transient` for the first `failures` calls sharing
//!   the same `key`, then echoes its parameters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use taskweave_core::workflow::capability::{Capability, CapabilityRegistry};
use taskweave_types::capability::{CapabilityError, ErrorCategory};

pub const BUILTIN_AGENT_TYPE: &str = "builtin";

/// Longest accepted `sleep`.
const MAX_SLEEP_MS: u64 = 10 * 60 * 1000;

#[derive(Default, Clone)]
pub struct BuiltinCapability {
    flaky_calls: Arc<DashMap<String, u64>>,
}

impl BuiltinCapability {
    pub fn new() -> Self {
        Self::default()
    }

    fn flaky(&self, parameters: &Value) -> Result<Value, CapabilityError> {
        let failures = parameters
            .get("failures")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let key = parameters
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        let call = {
            let mut entry = self.flaky_calls.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if call <= failures {
            tracing::debug!(key = %key, call, failures, "flaky builtin failing");
            Err(CapabilityError::transient(format!(
                "flaky '{key}' failure {call} of {failures}"
            )))
        } else {
            Ok(parameters.clone())
        }
    }
}

impl Capability for BuiltinCapability {
    async fn execute(&self, action: &str, parameters: &Value) -> Result<Value, CapabilityError> {
        match action {
            "echo" => Ok(parameters.clone()),
            "sleep" => {
                let ms = parameters
                    .get("ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CapabilityError::invalid_input("sleep requires integer 'ms'"))?;
                if ms > MAX_SLEEP_MS {
                    return Err(CapabilityError::invalid_input(format!(
                        "sleep of {ms}ms exceeds the {MAX_SLEEP_MS}ms limit"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }
            "fail" => {
                let category = parameters
                    .get("category")
                    .and_then(Value::as_str)
                    .map(ErrorCategory::from)
                    .unwrap_or(ErrorCategory::Internal);
                let message = parameters
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure");
                Err(CapabilityError::new(category, message))
            }
            "flaky" => self.flaky(parameters),
            other => Err(CapabilityError::new(
                ErrorCategory::NotFound,
                format!("unknown builtin action '{other}'"),
            )),
        }
    }
}

/// Registry with the builtins under [`BUILTIN_AGENT_TYPE`].
pub fn builtin_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(BUILTIN_AGENT_TYPE, BuiltinCapability::new());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_parameters() {
        let cap = BuiltinCapability::new();
        let params = json!({ "a": 1, "b": ["x"] });
        assert_eq!(cap.execute("echo", &params).await.unwrap(), params);
    }

    #[tokio::test]
    async fn sleep_waits_and_validates() {
        let cap = BuiltinCapability::new();
        let out = cap.execute("sleep", &json!({ "ms": 5 })).await.unwrap();
        assert_eq!(out, json!({ "slept_ms": 5 }));

        let err = cap.execute("sleep", &json!({})).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidInput);
    }

    #[tokio::test]
    async fn fail_uses_requested_category() {
        let cap = BuiltinCapability::new();
        let err = cap
            .execute("fail", &json!({ "category": "rate_limited", "message": "slow down" }))
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimited);
        assert_eq!(err.message, "slow down");

        let err = cap.execute("fail", &json!({})).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Internal);
    }

    #[tokio::test]
    async fn flaky_recovers_after_failures_per_key() {
        let cap = BuiltinCapability::new();
        let params = json!({ "key": "upload", "failures": 2 });
        assert!(cap.execute("flaky", &params).await.is_err());
        assert!(cap.execute("flaky", &params).await.is_err());
        assert_eq!(cap.execute("flaky", &params).await.unwrap(), params);

        // Separate key has its own counter.
        let other = json!({ "key": "download", "failures": 1 });
        let err = cap.execute("flaky", &other).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let cap = BuiltinCapability::new();
        let err = cap.execute("teleport", &json!({})).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::NotFound);
    }

    #[test]
    fn registry_resolves_builtin() {
        let registry = builtin_registry();
        assert!(registry.resolve(BUILTIN_AGENT_TYPE, "echo").is_some());
        assert!(registry.resolve("http", "get").is_none());
    }
}
