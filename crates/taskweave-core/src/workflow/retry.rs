//! Task invocation with retry, backoff, timeout, and circuit breaking.
//!
//! `TaskInvoker` runs one task's capability call to a terminal outcome:
//!
//! 1. Check the cancellation token (invocation boundary).
//! 2. Ask the capability key's circuit breaker for a permit. An open circuit
//!    fails immediately with `CircuitOpen` and is never retried.
//! 3. Call the capability, wrapped in `tokio::time::timeout` when a limit is set.
//! 4. On failure, retry while `retries < max_retries` and the error category is
//!    allowed, sleeping `base * multiplier^(retry - 1)` (capped) between
//!    attempts. The sleep races the cancellation token (retry boundary).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use taskweave_types::capability::{CapabilityError, ErrorCategory};
use taskweave_types::workflow::{RetryPolicy, TaskSpec};
use tokio_util::sync::CancellationToken;

use super::capability::CapabilityRegistry;
use super::circuit::CircuitBreakerRegistry;
use super::expression::ExpressionError;

// ---------------------------------------------------------------------------
// InvocationError
// ---------------------------------------------------------------------------

/// Terminal error of one task invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
    #[error("{0}")]
    Capability(CapabilityError),

    #[error("circuit open for '{key}'")]
    CircuitOpen { key: String },

    #[error("no capability registered for '{agent_type}.{action}'")]
    UnknownCapability { agent_type: String, action: String },

    #[error("{0}")]
    Unresolved(ExpressionError),

    #[error("execution cancelled")]
    Cancelled,

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl InvocationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            InvocationError::Capability(e) => e.category.clone(),
            InvocationError::CircuitOpen { .. } => ErrorCategory::Other("circuit_open".to_string()),
            InvocationError::UnknownCapability { .. } => ErrorCategory::NotFound,
            InvocationError::Unresolved(_) => ErrorCategory::InvalidInput,
            InvocationError::Cancelled => ErrorCategory::Other("cancelled".to_string()),
            InvocationError::Timeout { .. } => ErrorCategory::Timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation outcome
// ---------------------------------------------------------------------------

/// Outcome of [`TaskInvoker::invoke`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: Result<Value, InvocationError>,
    /// Attempts made, including one that short-circuited on an open circuit.
    pub attempts: u32,
}

/// Reported before each backoff sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

// ---------------------------------------------------------------------------
// TaskInvoker
// ---------------------------------------------------------------------------

/// Invokes capabilities on behalf of the scheduler.
#[derive(Debug, Clone)]
pub struct TaskInvoker {
    capabilities: Arc<CapabilityRegistry>,
    circuits: Arc<CircuitBreakerRegistry>,
    default_retry: RetryPolicy,
    default_timeout: Option<Duration>,
}

impl TaskInvoker {
    pub fn new(capabilities: Arc<CapabilityRegistry>, circuits: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            capabilities,
            circuits,
            default_retry: RetryPolicy::default(),
            default_timeout: None,
        }
    }

    /// Policy applied to tasks without their own `retry` block.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    /// Effective retry policy for `task`.
    pub fn retry_policy<'a>(&'a self, task: &'a TaskSpec) -> &'a RetryPolicy {
        task.retry.as_ref().unwrap_or(&self.default_retry)
    }

    /// Run `task` with already-resolved `parameters` until success, a
    /// non-retryable failure, retry exhaustion, or cancellation.
    pub async fn invoke(
        &self,
        task: &TaskSpec,
        parameters: &Value,
        cancel: &CancellationToken,
        on_retry: &(dyn Fn(RetryNotice) + Send + Sync),
    ) -> Invocation {
        let key = task.capability_key();
        let policy = self.retry_policy(task);
        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout);

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Invocation {
                    result: Err(InvocationError::Cancelled),
                    attempts: attempt,
                };
            }
            attempt += 1;

            let Some(capability) = self.capabilities.resolve(&task.agent_type, &task.action) else {
                return Invocation {
                    result: Err(InvocationError::UnknownCapability {
                        agent_type: task.agent_type.clone(),
                        action: task.action.clone(),
                    }),
                    attempts: attempt,
                };
            };

            let breaker = self.circuits.breaker(&key);
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    tracing::warn!(
                        task_id = %task.id,
                        capability = %key,
                        retry_after_ms = open.retry_after.as_millis() as u64,
                        "circuit open, failing fast"
                    );
                    return Invocation {
                        result: Err(InvocationError::CircuitOpen { key }),
                        attempts: attempt,
                    };
                }
            };

            tracing::debug!(task_id = %task.id, capability = %key, attempt, "invoking capability");
            let call = capability.execute_boxed(&task.action, parameters);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result.map_err(InvocationError::Capability),
                    Err(_) => Err(InvocationError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => call.await.map_err(InvocationError::Capability),
            };

            let error = match outcome {
                Ok(output) => {
                    permit.success();
                    return Invocation {
                        result: Ok(output),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            let category = error.category();
            if category.trips_circuit() {
                permit.failure();
            } else {
                drop(permit);
            }

            let retries_done = attempt - 1;
            if retries_done >= policy.max_retries || !policy.allows(&category) {
                return Invocation {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(
                task_id = %task.id,
                capability = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            on_retry(RetryNotice {
                attempt,
                delay,
                error: error.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Invocation {
                        result: Err(InvocationError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use taskweave_types::config::CircuitBreakerConfig;

    use super::*;

    fn invoker(registry: CapabilityRegistry, failure_threshold: u32) -> TaskInvoker {
        let circuits = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            reset_timeout_ms: 10_000,
        });
        TaskInvoker::new(Arc::new(registry), Arc::new(circuits))
    }

    /// Capability that fails the first `failures` calls, then echoes.
    fn flaky(calls: Arc<AtomicU32>, failures: u32, category: ErrorCategory) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("svc", move |_action, params| {
            let calls = Arc::clone(&calls);
            let category = category.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(CapabilityError::new(category, format!("call {n} failed")))
                } else {
                    Ok(params)
                }
            }
        });
        registry
    }

    fn no_retry_notice() -> impl Fn(RetryNotice) + Send + Sync {
        |_| {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_task_makes_max_retries_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), u32::MAX, ErrorCategory::Transient), 100);
        let task = TaskSpec::new("t", "svc", "call").with_retry(RetryPolicy::new(2, 100, 2.0));

        let notices = Mutex::new(Vec::new());
        let record = |n: RetryNotice| notices.lock().unwrap().push(n);
        let out = inv
            .invoke(&task, &json!({}), &CancellationToken::new(), &record)
            .await;

        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(out.result, Err(InvocationError::Capability(_))));

        let delays: Vec<Duration> = notices.lock().unwrap().iter().map(|n| n.delay).collect();
        assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), 2, ErrorCategory::Transient), 100);
        let task = TaskSpec::new("t", "svc", "call").with_retry(RetryPolicy::new(3, 10, 2.0));

        let out = inv
            .invoke(&task, &json!({ "x": 1 }), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert_eq!(out.result.unwrap(), json!({ "x": 1 }));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_outside_allow_list_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), u32::MAX, ErrorCategory::InvalidInput), 100);
        let task = TaskSpec::new("t", "svc", "call").with_retry(
            RetryPolicy::new(5, 10, 2.0).retry_on(vec![ErrorCategory::Transient, ErrorCategory::Timeout]),
        );

        let out = inv
            .invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert_eq!(out.attempts, 1);
        assert_eq!(out.result.unwrap_err().category(), ErrorCategory::InvalidInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits_without_calling() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), u32::MAX, ErrorCategory::Transient), 2);
        let task = TaskSpec::new("t", "svc", "call").with_retry(RetryPolicy::none());

        for _ in 0..2 {
            inv.invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let out = inv
            .invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert_eq!(
            out.result.unwrap_err(),
            InvocationError::CircuitOpen {
                key: "svc.call".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2, "capability not called");

        tokio::time::advance(Duration::from_millis(10_000)).await;
        inv.invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3, "half-open trial reaches capability");
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_trip_mid_retry_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), u32::MAX, ErrorCategory::Transient), 2);
        let task = TaskSpec::new("t", "svc", "call").with_retry(RetryPolicy::new(5, 10, 1.0));

        let out = inv
            .invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert!(matches!(out.result, Err(InvocationError::CircuitOpen { .. })));
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_input_does_not_trip_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), u32::MAX, ErrorCategory::InvalidInput), 1);
        let task = TaskSpec::new("t", "svc", "call").with_retry(RetryPolicy::none());

        for _ in 0..3 {
            inv.invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(inv.circuits().state("svc.call").unwrap().name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_category() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("slow", |_action, _params| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        });
        let inv = invoker(registry, 100);
        let task = TaskSpec::new("t", "slow", "wait")
            .with_timeout_ms(50)
            .with_retry(RetryPolicy::new(1, 10, 2.0));

        let out = inv
            .invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert_eq!(out.attempts, 2);
        assert_eq!(out.result.unwrap_err(), InvocationError::Timeout { timeout_ms: 50 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invoker(flaky(Arc::clone(&calls), u32::MAX, ErrorCategory::Transient), 100);
        let task = TaskSpec::new("t", "svc", "call").with_retry(RetryPolicy::new(3, 60_000, 2.0));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let on_retry = move |_n: RetryNotice| trigger.cancel();
        let out = inv.invoke(&task, &json!({}), &cancel, &on_retry).await;

        assert_eq!(out.result.unwrap_err(), InvocationError::Cancelled);
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let inv = invoker(CapabilityRegistry::new(), 5);
        let task = TaskSpec::new("t", "ghost", "run");
        let out = inv
            .invoke(&task, &json!({}), &CancellationToken::new(), &no_retry_notice())
            .await;
        assert!(matches!(out.result, Err(InvocationError::UnknownCapability { .. })));
        assert_eq!(out.attempts, 1);
    }
}
