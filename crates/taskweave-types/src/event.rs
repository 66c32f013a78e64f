//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast on every execution and task state change.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionStatus;

/// Lifecycle events emitted by the orchestration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The coordinator picked up an execution.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        workflow_version: String,
        trigger_type: String,
    },

    /// A task was dispatched to a worker.
    TaskStarted {
        execution_id: Uuid,
        task_id: String,
        capability: String,
    },

    /// A task attempt failed and will be retried after `delay_ms`.
    TaskRetrying {
        execution_id: Uuid,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    TaskSucceeded {
        execution_id: Uuid,
        task_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    TaskFailed {
        execution_id: Uuid,
        task_id: String,
        attempts: u32,
        error: String,
    },

    /// A task was skipped (false condition, failed dependency, cancellation).
    TaskSkipped {
        execution_id: Uuid,
        task_id: String,
        reason: String,
    },

    /// An execution reached a terminal status.
    ExecutionFinished {
        execution_id: Uuid,
        workflow_id: String,
        status: ExecutionStatus,
        steps_completed: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A chain rule started a downstream execution.
    ChainTriggered {
        parent_execution_id: Uuid,
        execution_id: Uuid,
        workflow_id: String,
        chain_depth: u32,
    },
}

impl EngineEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::TaskStarted { execution_id, .. }
            | EngineEvent::TaskRetrying { execution_id, .. }
            | EngineEvent::TaskSucceeded { execution_id, .. }
            | EngineEvent::TaskFailed { execution_id, .. }
            | EngineEvent::TaskSkipped { execution_id, .. }
            | EngineEvent::ExecutionFinished { execution_id, .. }
            | EngineEvent::ChainTriggered { execution_id, .. } => *execution_id,
        }
    }
}
