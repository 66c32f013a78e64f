//! Execution tracking types.
//!
//! An `Execution` is one run of a pinned workflow version. Each task in the
//! workflow gets exactly one `TaskResult` per execution, created up front
//! and updated as the task moves through its lifecycle.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capability::ErrorCategory;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single task within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Chained,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Schedule => "schedule",
            TriggerType::Chained => "chained",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine needs to know about who started an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    /// Free-form origin (user name, schedule id, parent execution id).
    pub triggered_by: String,
    /// Overrides for the workflow's seed variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Number of chain hops that led to this execution.
    #[serde(default)]
    pub chain_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
}

impl Trigger {
    pub fn manual(triggered_by: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            triggered_by: triggered_by.into(),
            variables: HashMap::new(),
            chain_depth: 0,
            parent_execution_id: None,
        }
    }

    pub fn schedule(schedule_id: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Schedule,
            ..Self::manual(schedule_id)
        }
    }

    /// Trigger for an execution started by a chain rule of `parent`.
    pub fn chained(parent: &Execution) -> Self {
        Self {
            trigger_type: TriggerType::Chained,
            triggered_by: parent.id.to_string(),
            variables: HashMap::new(),
            chain_depth: parent.chain_depth + 1,
            parent_execution_id: Some(parent.id),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    pub workflow_id: String,
    /// The exact definition version this execution runs.
    pub workflow_version: Version,
    pub status: ExecutionStatus,
    pub triggered_by: String,
    pub trigger_type: TriggerType,
    pub chain_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    /// Workflow seed variables merged with trigger overrides.
    pub variables: HashMap<String, Value>,
    /// Tasks that finished successfully.
    pub steps_completed: u32,
    pub total_steps: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Heartbeat: bumped on every state change. Used for stale detection.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Execution {
    /// Create a pending execution with variables seeded from the workflow
    /// and overridden by the trigger.
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: Version,
        seed_variables: &HashMap<String, Value>,
        total_steps: u32,
        trigger: &Trigger,
    ) -> Self {
        let now = Utc::now();
        let mut variables = seed_variables.clone();
        variables.extend(trigger.variables.clone());
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            workflow_version,
            status: ExecutionStatus::Pending,
            triggered_by: trigger.triggered_by.clone(),
            trigger_type: trigger.trigger_type,
            chain_depth: trigger.chain_depth,
            parent_execution_id: trigger.parent_execution_id,
            variables,
            steps_completed: 0,
            total_steps,
            started_at: now,
            completed_at: None,
            updated_at: now,
            error_message: None,
        }
    }

    /// Wall-clock duration, if the execution has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }
}

/// A partial update to an execution. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub variables: Option<HashMap<String, Value>>,
    pub steps_completed: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ExecutionPatch {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that moves an execution to a terminal status, stamping `completed_at`.
    pub fn finished(status: ExecutionStatus, error_message: Option<String>) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(Utc::now()),
            error_message,
            ..Self::default()
        }
    }

    pub fn with_steps_completed(mut self, steps: u32) -> Self {
        self.steps_completed = Some(steps);
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Apply this patch in place and bump the heartbeat.
    pub fn apply(&self, execution: &mut Execution, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(variables) = &self.variables {
            execution.variables = variables.clone();
        }
        if let Some(steps) = self.steps_completed {
            execution.steps_completed = steps;
        }
        if let Some(completed_at) = self.completed_at {
            execution.completed_at = Some(completed_at);
        }
        if let Some(message) = &self.error_message {
            execution.error_message = Some(message.clone());
        }
        execution.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Task Result
// ---------------------------------------------------------------------------

/// The per-execution record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Capability invocations made so far (1-based once started).
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            output: None,
            error: None,
            error_category: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, output: Value) {
        self.status = TaskStatus::Succeeded;
        self.output = Some(output);
        self.error = None;
        self.error_category = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, category: Option<ErrorCategory>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.error_category = category;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self, reason: Option<String>) {
        self.status = TaskStatus::Skipped;
        self.error = reason;
        self.finished_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());

        assert!(!TaskStatus::Ready.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_trigger_overrides_seed_variables() {
        let seed = HashMap::from([
            ("region".to_string(), json!("eu")),
            ("limit".to_string(), json!(10)),
        ]);
        let trigger = Trigger::manual("alice").with_variable("limit", json!(50));
        let exec = Execution::new("ingest", Version::new(1, 0, 0), &seed, 3, &trigger);

        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.variables["region"], json!("eu"));
        assert_eq!(exec.variables["limit"], json!(50));
        assert_eq!(exec.total_steps, 3);
        assert_eq!(exec.trigger_type, TriggerType::Manual);
    }

    #[test]
    fn test_chained_trigger_increments_depth() {
        let parent = Execution::new(
            "a",
            Version::new(1, 0, 0),
            &HashMap::new(),
            1,
            &Trigger::manual("test"),
        );
        let trigger = Trigger::chained(&parent);
        assert_eq!(trigger.chain_depth, 1);
        assert_eq!(trigger.parent_execution_id, Some(parent.id));
        assert_eq!(trigger.trigger_type, TriggerType::Chained);
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let mut exec = Execution::new(
            "a",
            Version::new(1, 0, 0),
            &HashMap::new(),
            2,
            &Trigger::manual("test"),
        );
        let before = exec.updated_at;
        let later = before + chrono::Duration::seconds(5);

        ExecutionPatch::status(ExecutionStatus::Running).apply(&mut exec, later);
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.completed_at.is_none());
        assert_eq!(exec.updated_at, later);

        ExecutionPatch::finished(ExecutionStatus::Failed, Some("boom".into()))
            .with_steps_completed(1)
            .apply(&mut exec, later);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.steps_completed, 1);
        assert_eq!(exec.error_message.as_deref(), Some("boom"));
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_task_result_transitions() {
        let mut result = TaskResult::pending("fetch");
        result.mark_running();
        assert!(result.started_at.is_some());
        result.mark_failed("timed out", Some(ErrorCategory::Timeout));
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_category, Some(ErrorCategory::Timeout));
    }
}
