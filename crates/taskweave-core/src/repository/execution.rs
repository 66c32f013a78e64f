//! Execution store trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, and
//! per-task results. The infrastructure layer (taskweave-infra) implements
//! this trait with SQLite persistence; `InMemoryExecutionStore` backs tests
//! and single-process runs.

use semver::Version;
use taskweave_types::error::RepositoryError;
use taskweave_types::execution::{Execution, ExecutionPatch, ExecutionStatus, TaskResult};
use taskweave_types::workflow::Workflow;
use uuid::Uuid;

/// Storage for workflow definitions and execution state.
///
/// Covers three entity families:
/// - **Definitions:** versioned workflow definitions, immutable once saved.
/// - **Executions:** one record per run, updated with partial patches.
/// - **Task results:** one record per (execution, task), ordered as defined.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Persist a workflow definition under `(id, version)`.
    ///
    /// Saving an identical definition again is a no-op; saving a different
    /// definition under an existing version is a `Conflict`.
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get the exact version of a workflow definition.
    fn get_workflow(
        &self,
        workflow_id: &str,
        version: &Version,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List every stored definition (all versions).
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create an execution and all of its task results atomically.
    fn create_execution(
        &self,
        execution: &Execution,
        tasks: &[TaskResult],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply a partial update and return the updated execution.
    ///
    /// Always bumps `updated_at`. Returns `NotFound` for unknown ids.
    fn update_execution(
        &self,
        execution_id: &Uuid,
        patch: &ExecutionPatch,
    ) -> impl std::future::Future<Output = Result<Execution, RepositoryError>> + Send;

    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions whose status is one of `statuses`, oldest first.
    fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Task results
    // -----------------------------------------------------------------------

    /// Replace the stored result for `result.task_id` and bump the
    /// owning execution's `updated_at`.
    fn update_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Task results for an execution, in workflow definition order.
    fn list_task_results(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskResult>, RepositoryError>> + Send;
}
