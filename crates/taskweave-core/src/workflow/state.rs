//! Execution state manager.
//!
//! Wraps an `ExecutionStore` with the lifecycle rules for executions and
//! task results. Every engine mutation goes through here:
//!
//! - Terminal executions are immutable. Writes against one fail with
//!   `AlreadyTerminal`, which is how a coordinator learns that the stale
//!   sweep reclaimed its execution.
//! - `cleanup_stale` fails `running` executions whose heartbeat
//!   (`updated_at`) is older than the cutoff.
//! - `recover` fails every non-terminal execution left by a dead process.
//!
//! Execution-level writes are serialized by one async mutex so the
//! check-then-write in each operation cannot interleave with the sweep.

use std::time::Duration;

use chrono::Utc;
use taskweave_types::execution::{
    Execution, ExecutionPatch, ExecutionStatus, TaskResult, TaskStatus,
};
use taskweave_types::workflow::Workflow;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::execution::ExecutionStore;

/// Error prefix for executions reclaimed by the stale sweep.
pub const STALE_REASON: &str = "Timeout";

/// Error for executions found running when the engine starts.
pub const INTERRUPTED_REASON: &str = "interrupted";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("state repository error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution {execution_id} is already {status}")]
    AlreadyTerminal {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

fn repo_err(e: impl std::fmt::Display) -> StateError {
    StateError::Repository(e.to_string())
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Lifecycle-aware facade over an `ExecutionStore`.
pub struct StateManager<S: ExecutionStore> {
    store: S,
    write_lock: Mutex<()>,
}

impl<S: ExecutionStore> StateManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist the definition an execution is about to run.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StateError> {
        self.store.save_workflow(workflow).await.map_err(repo_err)
    }

    /// Persist a new execution together with its initial task results.
    pub async fn create(&self, execution: &Execution, tasks: &[TaskResult]) -> Result<(), StateError> {
        self.store
            .create_execution(execution, tasks)
            .await
            .map_err(repo_err)?;
        tracing::debug!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            tasks = tasks.len(),
            "created execution"
        );
        Ok(())
    }

    /// Apply a partial update to a non-terminal execution.
    pub async fn update(&self, execution_id: Uuid, patch: &ExecutionPatch) -> Result<Execution, StateError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_open(execution_id).await?;
        let updated = self
            .store
            .update_execution(&execution_id, patch)
            .await
            .map_err(repo_err)?;
        tracing::debug!(
            execution_id = %execution_id,
            status = %updated.status,
            steps_completed = updated.steps_completed,
            "updated execution"
        );
        Ok(updated)
    }

    /// Record a task transition. Also serves as the execution's heartbeat.
    pub async fn record_task(&self, execution_id: Uuid, result: &TaskResult) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_open(execution_id).await?;
        self.store
            .update_task_result(&execution_id, result)
            .await
            .map_err(repo_err)?;
        tracing::debug!(
            execution_id = %execution_id,
            task_id = %result.task_id,
            status = %result.status,
            attempts = result.attempt_count,
            "recorded task result"
        );
        Ok(())
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, StateError> {
        self.store.get_execution(&execution_id).await.map_err(repo_err)
    }

    pub async fn tasks(&self, execution_id: Uuid) -> Result<Vec<TaskResult>, StateError> {
        if self.get(execution_id).await?.is_none() {
            return Err(StateError::NotFound(execution_id));
        }
        self.store
            .list_task_results(&execution_id)
            .await
            .map_err(repo_err)
    }

    /// Executions that are `pending` or `running`, oldest first.
    pub async fn list_active(&self) -> Result<Vec<Execution>, StateError> {
        self.store
            .list_executions_by_status(&[ExecutionStatus::Pending, ExecutionStatus::Running])
            .await
            .map_err(repo_err)
    }

    /// Fail every `running` execution with no update in the last `max_age`.
    ///
    /// Returns the ids that were reclaimed.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<Vec<Uuid>, StateError> {
        let running = self
            .store
            .list_executions_by_status(&[ExecutionStatus::Running])
            .await
            .map_err(repo_err)?;

        let mut reclaimed = Vec::new();
        for candidate in running {
            let _guard = self.write_lock.lock().await;
            // Re-read under the lock; the coordinator may have written since.
            let Some(current) = self.get(candidate.id).await? else {
                continue;
            };
            if current.status != ExecutionStatus::Running || !is_stale(&current, max_age) {
                continue;
            }
            let reason = format!("{STALE_REASON}: no progress for {max_age:?}");
            self.settle(&current, ExecutionStatus::Failed, &reason).await?;
            tracing::warn!(
                execution_id = %current.id,
                workflow_id = %current.workflow_id,
                last_update = %current.updated_at,
                "reclaimed stale execution"
            );
            reclaimed.push(current.id);
        }
        Ok(reclaimed)
    }

    /// Fail every non-terminal execution. Call once at startup, before any
    /// execution is submitted in this process.
    pub async fn recover(&self) -> Result<Vec<Uuid>, StateError> {
        let _guard = self.write_lock.lock().await;
        let orphaned = self.list_active().await?;
        let mut recovered = Vec::with_capacity(orphaned.len());
        for execution in orphaned {
            self.settle(&execution, ExecutionStatus::Failed, INTERRUPTED_REASON)
                .await?;
            tracing::info!(
                execution_id = %execution.id,
                workflow_id = %execution.workflow_id,
                "failed interrupted execution"
            );
            recovered.push(execution.id);
        }
        Ok(recovered)
    }

    /// Cancel an execution that no coordinator in this process owns.
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> Result<Execution, StateError> {
        let _guard = self.write_lock.lock().await;
        let execution = self.ensure_open(execution_id).await?;
        self.settle(&execution, ExecutionStatus::Cancelled, reason).await
    }

    // -----------------------------------------------------------------------
    // Internals (caller holds write_lock)
    // -----------------------------------------------------------------------

    async fn ensure_open(&self, execution_id: Uuid) -> Result<Execution, StateError> {
        let execution = self
            .get(execution_id)
            .await?
            .ok_or(StateError::NotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Err(StateError::AlreadyTerminal {
                execution_id,
                status: execution.status,
            });
        }
        Ok(execution)
    }

    /// In-flight tasks become `failed`, unstarted ones `skipped`, then the
    /// execution itself moves to `status` with `reason`.
    async fn settle(
        &self,
        execution: &Execution,
        status: ExecutionStatus,
        reason: &str,
    ) -> Result<Execution, StateError> {
        let tasks = self
            .store
            .list_task_results(&execution.id)
            .await
            .map_err(repo_err)?;
        let mut steps_completed = 0;
        for mut task in tasks {
            match task.status {
                TaskStatus::Running | TaskStatus::Ready => task.mark_failed(reason, None),
                TaskStatus::Pending => task.mark_skipped(Some(reason.to_string())),
                TaskStatus::Succeeded => {
                    steps_completed += 1;
                    continue;
                }
                TaskStatus::Failed | TaskStatus::Skipped => continue,
            }
            self.store
                .update_task_result(&execution.id, &task)
                .await
                .map_err(repo_err)?;
        }
        self.store
            .update_execution(
                &execution.id,
                &ExecutionPatch::finished(status, Some(reason.to_string()))
                    .with_steps_completed(steps_completed),
            )
            .await
            .map_err(repo_err)
    }
}

fn is_stale(execution: &Execution, max_age: Duration) -> bool {
    (Utc::now() - execution.updated_at)
        .to_std()
        .map(|age| age > max_age)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use semver::Version;
    use serde_json::json;
    use taskweave_types::execution::Trigger;

    use super::*;
    use crate::repository::memory::InMemoryExecutionStore;

    fn manager() -> StateManager<InMemoryExecutionStore> {
        StateManager::new(InMemoryExecutionStore::new())
    }

    fn execution(status: ExecutionStatus, age: chrono::Duration) -> Execution {
        let mut exec = Execution::new(
            "wf",
            Version::new(1, 0, 0),
            &HashMap::new(),
            3,
            &Trigger::manual("test"),
        );
        exec.status = status;
        exec.updated_at = Utc::now() - age;
        exec
    }

    fn tasks() -> Vec<TaskResult> {
        let mut done = TaskResult::pending("a");
        done.mark_running();
        done.mark_succeeded(json!(1));
        let mut running = TaskResult::pending("b");
        running.mark_running();
        vec![done, running, TaskResult::pending("c")]
    }

    #[tokio::test]
    async fn test_update_and_terminal_guard() {
        let mgr = manager();
        let exec = execution(ExecutionStatus::Pending, chrono::Duration::zero());
        mgr.create(&exec, &tasks()).await.unwrap();

        let running = mgr
            .update(exec.id, &ExecutionPatch::status(ExecutionStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);

        mgr.update(exec.id, &ExecutionPatch::finished(ExecutionStatus::Completed, None))
            .await
            .unwrap();

        let err = mgr
            .update(exec.id, &ExecutionPatch::status(ExecutionStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StateError::AlreadyTerminal {
                execution_id: exec.id,
                status: ExecutionStatus::Completed
            }
        );

        let err = mgr
            .record_task(exec.id, &TaskResult::pending("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_not_found() {
        let mgr = manager();
        let id = Uuid::now_v7();
        assert_eq!(
            mgr.update(id, &ExecutionPatch::default()).await.unwrap_err(),
            StateError::NotFound(id)
        );
        assert_eq!(mgr.tasks(id).await.unwrap_err(), StateError::NotFound(id));
        assert!(mgr.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_active() {
        let mgr = manager();
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Cancelled,
        ] {
            mgr.create(&execution(status, chrono::Duration::zero()), &[])
                .await
                .unwrap();
        }
        let active = mgr.list_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|e| !e.status.is_terminal()));
    }

    #[tokio::test]
    async fn test_cleanup_stale_reclaims_only_old_running() {
        let mgr = manager();
        let stale = execution(ExecutionStatus::Running, chrono::Duration::minutes(45));
        let fresh = execution(ExecutionStatus::Running, chrono::Duration::seconds(5));
        let old_pending = execution(ExecutionStatus::Pending, chrono::Duration::minutes(45));
        for exec in [&stale, &fresh, &old_pending] {
            mgr.create(exec, &tasks()).await.unwrap();
        }

        let reclaimed = mgr.cleanup_stale(Duration::from_secs(30 * 60)).await.unwrap();
        assert_eq!(reclaimed, vec![stale.id]);

        let failed = mgr.get(stale.id).await.unwrap().unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.error_message.unwrap().starts_with("Timeout"));
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.steps_completed, 1);

        let results = mgr.tasks(stale.id).await.unwrap();
        let statuses: Vec<TaskStatus> = results.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Skipped]
        );

        let active: Vec<Uuid> = mgr.list_active().await.unwrap().iter().map(|e| e.id).collect();
        assert!(!active.contains(&stale.id));
        assert!(active.contains(&fresh.id));

        // A coordinator still holding the reclaimed execution is refused.
        let err = mgr
            .update(stale.id, &ExecutionPatch::finished(ExecutionStatus::Completed, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_recover_fails_all_active() {
        let mgr = manager();
        let running = execution(ExecutionStatus::Running, chrono::Duration::zero());
        let pending = execution(ExecutionStatus::Pending, chrono::Duration::zero());
        let done = execution(ExecutionStatus::Completed, chrono::Duration::zero());
        for exec in [&running, &pending, &done] {
            mgr.create(exec, &tasks()).await.unwrap();
        }

        let mut recovered = mgr.recover().await.unwrap();
        recovered.sort();
        let mut expected = vec![running.id, pending.id];
        expected.sort();
        assert_eq!(recovered, expected);

        let exec = mgr.get(running.id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error_message.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(mgr.get(done.id).await.unwrap().unwrap().status, ExecutionStatus::Completed);
        assert!(mgr.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_settles_tasks() {
        let mgr = manager();
        let exec = execution(ExecutionStatus::Running, chrono::Duration::zero());
        mgr.create(&exec, &tasks()).await.unwrap();

        let cancelled = mgr.cancel(exec.id, "stopped by operator").await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some("stopped by operator"));

        let results = mgr.tasks(exec.id).await.unwrap();
        assert_eq!(results[1].status, TaskStatus::Failed);
        assert_eq!(results[2].status, TaskStatus::Skipped);

        assert!(matches!(
            mgr.cancel(exec.id, "again").await,
            Err(StateError::AlreadyTerminal { .. })
        ));
    }
}
