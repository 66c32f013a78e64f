//! Workflow definition types for Taskweave.
//!
//! A `Workflow` is a named, versioned set of `TaskSpec`s whose `depends_on`
//! edges form a DAG. Definitions are immutable once registered: every
//! execution pins the exact version it was started from.

use std::collections::HashMap;
use std::time::Duration;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::ErrorCategory;
use crate::execution::ExecutionStatus;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow definition: tasks, seed variables, failure policy, and the
/// chain rules that fire when one of its executions finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable identifier (e.g. "daily-ingest"). Shared by all versions.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semantic version of this definition.
    #[serde(default = "default_version")]
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tasks forming the DAG.
    pub tasks: Vec<TaskSpec>,
    /// Seed variables, overridable per execution by the trigger.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
    /// What happens to the rest of the graph when a task fails.
    #[serde(default, alias = "onError")]
    pub on_error: OnErrorPolicy,
    /// Implicit ordering: a task without `depends_on` waits for the task
    /// declared just before it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sequential: bool,
    /// Rules that start other workflows when an execution of this one finishes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<ChainRule>,
}

fn default_version() -> Version {
    Version::new(1, 0, 0)
}

impl Workflow {
    pub fn new(id: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            description: None,
            tasks,
            variables: HashMap::new(),
            on_error: OnErrorPolicy::default(),
            sequential: false,
            chains: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_on_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_chain(mut self, rule: ChainRule) -> Self {
        self.chains.push(rule);
        self
    }

    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

/// Workflow-level failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Dependents of a failed task are skipped as soon as the failure is seen.
    #[default]
    Stop,
    /// Failures do not block independent branches; a task is skipped only
    /// once all of its dependencies have settled and one of them did not succeed.
    Continue,
}

// ---------------------------------------------------------------------------
// Task Spec
// ---------------------------------------------------------------------------

/// A single node in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Capability family (e.g. "http", "llm"). Resolved via the capability registry.
    #[serde(alias = "agentType")]
    pub agent_type: String,
    /// Operation within the capability family.
    pub action: String,
    /// Parameters passed to the capability. String leaves may contain
    /// `{{...}}` placeholders resolved just before invocation.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, Value>,
    /// Ids of tasks that must finish before this one can start.
    #[serde(default, alias = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Higher priority tasks are dispatched first among ready tasks.
    #[serde(default)]
    pub priority: i32,
    /// Per-task retry policy. Falls back to the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Optional JEXL expression; a false result skips the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-invocation timeout in milliseconds.
    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Run the capability once per element of a collection.
    #[serde(default, alias = "forEach", skip_serializing_if = "Option::is_none")]
    pub for_each: Option<FanOutSpec>,
    /// Copy the task output into this execution variable on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
    /// Id of a fallback task that runs if this one fails. A failure whose
    /// handler succeeds does not fail the execution.
    #[serde(default, alias = "onError", skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            agent_type: agent_type.into(),
            action: action.into(),
            parameters: serde_json::Map::new(),
            depends_on: Vec::new(),
            priority: 0,
            retry: None,
            condition: None,
            timeout_ms: None,
            for_each: None,
            export: None,
            on_error: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_for_each(mut self, spec: FanOutSpec) -> Self {
        self.for_each = Some(spec);
        self
    }

    pub fn with_export(mut self, variable: impl Into<String>) -> Self {
        self.export = Some(variable.into());
        self
    }

    pub fn with_on_error(mut self, handler: impl Into<String>) -> Self {
        self.on_error = Some(handler.into());
        self
    }

    /// Key used for capability overrides and circuit breaker isolation.
    pub fn capability_key(&self) -> String {
        format!("{}.{}", self.agent_type, self.action)
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Exponential backoff policy for capability invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms", alias = "baseDelayMs")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms", alias = "maxDelayMs")]
    pub max_delay_ms: u64,
    /// Categories eligible for retry. `None` retries every category.
    #[serde(default, alias = "retryOn", skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorCategory>>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retry_on: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn new(max_retries: u32, base_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            backoff_multiplier,
            ..Self::default()
        }
    }

    pub fn retry_on(mut self, categories: Vec<ErrorCategory>) -> Self {
        self.retry_on = Some(categories);
        self
    }

    /// Delay before retry number `retry` (1-based):
    /// `base_delay_ms * backoff_multiplier^(retry - 1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether a failure of `category` may be retried under this policy.
    pub fn allows(&self, category: &ErrorCategory) -> bool {
        match &self.retry_on {
            Some(categories) => categories.contains(category),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Per-element execution of a task over a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutSpec {
    /// A literal array, or a placeholder string resolving to one.
    pub items: Value,
    /// Maximum element invocations in flight at once.
    #[serde(default = "default_fan_out_concurrency")]
    pub concurrency: usize,
    /// Fail the whole task as soon as any element fails.
    #[serde(default, alias = "failFast")]
    pub fail_fast: bool,
    /// How successful element outputs are combined.
    #[serde(default)]
    pub aggregate: Aggregation,
}

fn default_fan_out_concurrency() -> usize {
    5
}

impl FanOutSpec {
    pub fn over(items: Value) -> Self {
        Self {
            items,
            concurrency: default_fan_out_concurrency(),
            fail_fast: false,
            aggregate: Aggregation::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn with_aggregate(mut self, aggregate: Aggregation) -> Self {
        self.aggregate = aggregate;
        self
    }
}

/// Built-in aggregation strategies for fan-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Successful outputs as an array, in input order.
    #[default]
    Collect,
    /// Number of successful elements.
    Count,
    /// Flatten array outputs (non-arrays are appended as-is).
    Concat,
    /// Shallow-merge object outputs, later elements winning.
    Merge,
    /// Sum of numeric outputs.
    Sum,
}

// ---------------------------------------------------------------------------
// Chain rules
// ---------------------------------------------------------------------------

/// Starts another workflow when an execution of the owning workflow finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRule {
    /// Terminal statuses that fire this rule.
    #[serde(default = "default_chain_when")]
    pub when: Vec<ExecutionStatus>,
    /// Optional JEXL guard evaluated against the finished execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Id of the workflow to start.
    #[serde(rename = "then")]
    pub target: String,
    /// Version requirement for the target. Latest registered when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionReq>,
    /// Variables passed to the target. String values may hold placeholders
    /// over the source execution (`{{workflow.x}}`, `{{tasks.t.output}}`).
    #[serde(default, rename = "with", skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
}

fn default_chain_when() -> Vec<ExecutionStatus> {
    vec![ExecutionStatus::Completed]
}

impl ChainRule {
    pub fn on_completed(target: impl Into<String>) -> Self {
        Self {
            when: default_chain_when(),
            condition: None,
            target: target.into(),
            version: None,
            variables: HashMap::new(),
        }
    }

    pub fn on(mut self, statuses: Vec<ExecutionStatus>) -> Self {
        self.when = statuses;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_version(mut self, version: VersionReq) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn fires_on(&self, status: ExecutionStatus) -> bool {
        self.when.contains(&status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
