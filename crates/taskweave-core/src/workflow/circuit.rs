//! Per-capability circuit breakers.
//!
//! Each capability key (`agent_type.action`) gets its own breaker. Breakers
//! live in a process-wide `CircuitBreakerRegistry` shared by every execution;
//! tests and embedders can build a fresh registry instead of the global one.
//!
//! Transitions:
//! - `closed -> open` after `failure_threshold` consecutive failures
//! - `open -> half_open` once `reset_timeout` has elapsed (on the next acquire)
//! - `half_open -> closed` after `success_threshold` trial successes
//! - `half_open -> open` on any trial failure
//!
//! Only one trial invocation is in flight while half-open.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use taskweave_types::config::CircuitBreakerConfig;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// CircuitState
// ---------------------------------------------------------------------------

/// Circuit breaker state for one capability key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Failing fast until `opened_at + reset_timeout`.
    Open { opened_at: Instant },
    /// Trial invocations allowed one at a time.
    HalfOpen {
        successes: u32,
        trial_in_flight: bool,
    },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Returned when a call is rejected without reaching the capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for '{key}' (retry in {retry_after:?})")]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Breaker for a single capability key.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed {
                    consecutive_failures: 0,
                },
                failure_count: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State transitions never panic while holding the lock; recover the
        // data rather than propagating poison.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, after applying any due `open -> half_open` transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        inner.state.clone()
    }

    /// Total failures recorded over the breaker's lifetime.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.lock().last_failure_at
    }

    /// Ask permission to invoke the capability.
    ///
    /// The returned permit must be settled with `success()` or `failure()`.
    /// Dropping it unsettled releases a half-open trial slot without
    /// counting as either outcome.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, CircuitOpenError> {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        match &mut inner.state {
            CircuitState::Closed { .. } => Ok(CircuitPermit::new(Arc::clone(self), false)),
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                Err(CircuitOpenError {
                    key: self.key.clone(),
                    retry_after: self.config.reset_timeout().saturating_sub(elapsed),
                })
            }
            CircuitState::HalfOpen {
                trial_in_flight, ..
            } => {
                if *trial_in_flight {
                    Err(CircuitOpenError {
                        key: self.key.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    *trial_in_flight = true;
                    Ok(CircuitPermit::new(Arc::clone(self), true))
                }
            }
        }
    }

    fn promote_if_due(&self, inner: &mut Inner) {
        if let CircuitState::Open { opened_at } = inner.state {
            if opened_at.elapsed() >= self.config.reset_timeout() {
                tracing::info!(capability = %self.key, "circuit half-open, allowing trial");
                inner.state = CircuitState::HalfOpen {
                    successes: 0,
                    trial_in_flight: false,
                };
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        match &mut inner.state {
            CircuitState::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            CircuitState::HalfOpen {
                successes,
                trial_in_flight,
            } if trial => {
                *trial_in_flight = false;
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    tracing::info!(capability = %self.key, "circuit closed");
                    inner.state = CircuitState::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            // A non-trial call that started before the circuit opened.
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.failure_count += 1;
        inner.last_failure_at = Some(now);
        match &mut inner.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        capability = %self.key,
                        failures = *consecutive_failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open { opened_at: now };
                }
            }
            CircuitState::HalfOpen { .. } if trial => {
                tracing::warn!(capability = %self.key, "trial failed, circuit re-opened");
                inner.state = CircuitState::Open { opened_at: now };
            }
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if let CircuitState::HalfOpen {
            trial_in_flight, ..
        } = &mut inner.state
        {
            *trial_in_flight = false;
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitPermit
// ---------------------------------------------------------------------------

/// Permission to make one call through a breaker.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerRegistry
// ---------------------------------------------------------------------------

/// Breakers keyed by capability key, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

static GLOBAL: OnceLock<Arc<CircuitBreakerRegistry>> = OnceLock::new();

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Process-wide registry with default thresholds.
    pub fn global() -> Arc<CircuitBreakerRegistry> {
        Self::global_with(CircuitBreakerConfig::default())
    }

    /// Process-wide registry, created with `config` on first use.
    ///
    /// The first caller fixes the configuration; later calls get the existing
    /// registry unchanged. Breakers are never torn down.
    pub fn global_with(config: CircuitBreakerConfig) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(CircuitBreakerRegistry::new(config))))
    }

    /// Breaker for `key`, creating it on first use.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
                .value(),
        )
    }

    /// State of `key`, if a breaker exists for it.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    /// Snapshot of all breakers, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut all: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            reset_timeout_ms: reset_ms,
        }
    }

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("http.get", config(failures, successes, reset_ms)))
    }

    fn fail_n(b: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            b.try_acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let b = breaker(3, 1, 1000);
        fail_n(&b, 2);
        assert_eq!(b.state().name(), "closed");
        fail_n(&b, 1);
        assert_eq!(b.state().name(), "open");

        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.key, "http.get");
        assert_eq!(err.retry_after, Duration::from_millis(1000));
        assert_eq!(b.failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker(3, 1, 1000);
        fail_n(&b, 2);
        b.try_acquire().unwrap().success();
        fail_n(&b, 2);
        assert_eq!(
            b.state(),
            CircuitState::Closed {
                consecutive_failures: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_allows_single_trial() {
        let b = breaker(1, 1, 500);
        fail_n(&b, 1);
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(500)).await;
        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(b.try_acquire().is_err(), "second concurrent trial rejected");

        trial.success();
        assert_eq!(b.state().name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let b = breaker(1, 1, 500);
        fail_n(&b, 1);
        tokio::time::advance(Duration::from_millis(600)).await;

        b.try_acquire().unwrap().failure();
        assert_eq!(b.state().name(), "open");
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_multiple_trials() {
        let b = breaker(1, 2, 100);
        fail_n(&b, 1);
        tokio::time::advance(Duration::from_millis(100)).await;

        b.try_acquire().unwrap().success();
        assert_eq!(b.state().name(), "half_open");
        b.try_acquire().unwrap().success();
        assert_eq!(b.state().name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_frees_slot() {
        let b = breaker(1, 1, 100);
        fail_n(&b, 1);
        tokio::time::advance(Duration::from_millis(100)).await;

        drop(b.try_acquire().unwrap());
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn test_registry_shares_breaker_per_key() {
        let registry = CircuitBreakerRegistry::new(config(2, 1, 1000));
        let a = registry.breaker("http.get");
        let b = registry.breaker("http.get");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &registry.breaker("http.post")));

        a.try_acquire().unwrap().failure();
        a.try_acquire().unwrap().failure();
        assert_eq!(registry.state("http.get").unwrap().name(), "open");
        assert_eq!(registry.state("http.post").unwrap().name(), "closed");
        assert!(registry.state("mail.send").is_none());
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = CircuitBreakerRegistry::global();
        let b = CircuitBreakerRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
