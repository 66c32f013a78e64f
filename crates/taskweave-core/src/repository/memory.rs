//! In-process `ExecutionStore` backed by `tokio::sync::RwLock` maps.
//!
//! Cloning the store shares the underlying state, so an engine and its
//! observers can hold handles to the same data.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use semver::Version;
use taskweave_types::error::RepositoryError;
use taskweave_types::execution::{Execution, ExecutionPatch, ExecutionStatus, TaskResult};
use taskweave_types::workflow::Workflow;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::execution::ExecutionStore;

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<(String, Version), Workflow>,
    executions: HashMap<Uuid, Execution>,
    task_results: HashMap<Uuid, Vec<TaskResult>>,
}

/// Volatile execution store. State is lost when the process exits.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryExecutionStore").finish_non_exhaustive()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let key = (workflow.id.clone(), workflow.version.clone());
        match state.workflows.get(&key) {
            Some(existing) if existing != workflow => Err(RepositoryError::Conflict(format!(
                "workflow '{}' version {} already exists with a different definition",
                workflow.id, workflow.version
            ))),
            Some(_) => Ok(()),
            None => {
                state.workflows.insert(key, workflow.clone());
                Ok(())
            }
        }
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
        version: &Version,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .workflows
            .get(&(workflow_id.to_string(), version.clone()))
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let state = self.state.read().await;
        let mut workflows: Vec<Workflow> = state.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.version.cmp(&b.version)));
        Ok(workflows)
    }

    async fn create_execution(
        &self,
        execution: &Execution,
        tasks: &[TaskResult],
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        state.executions.insert(execution.id, execution.clone());
        state.task_results.insert(execution.id, tasks.to_vec());
        Ok(())
    }

    async fn update_execution(
        &self,
        execution_id: &Uuid,
        patch: &ExecutionPatch,
    ) -> Result<Execution, RepositoryError> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        patch.apply(execution, Utc::now());
        Ok(execution.clone())
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.executions.get(execution_id).cloned())
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, RepositoryError> {
        let state = self.state.read().await;
        let mut matching: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.started_at);
        Ok(matching)
    }

    async fn update_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let MemoryState {
            executions,
            task_results,
            ..
        } = &mut *state;

        let execution = executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        let slot = task_results
            .get_mut(execution_id)
            .and_then(|results| results.iter_mut().find(|r| r.task_id == result.task_id))
            .ok_or(RepositoryError::NotFound)?;

        *slot = result.clone();
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn list_task_results(&self, execution_id: &Uuid) -> Result<Vec<TaskResult>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .task_results
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use taskweave_types::execution::{TaskStatus, Trigger};
    use taskweave_types::workflow::TaskSpec;

    fn execution() -> Execution {
        Execution::new("wf", Version::new(1, 0, 0), &Map::new(), 2, &Trigger::manual("test"))
    }

    #[tokio::test]
    async fn test_create_and_read_back_in_definition_order() {
        let store = InMemoryExecutionStore::new();
        let exec = execution();
        store
            .create_execution(&exec, &[TaskResult::pending("b"), TaskResult::pending("a")])
            .await
            .unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, exec.id);

        let tasks = store.list_task_results(&exec.id).await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_duplicate_execution_is_conflict() {
        let store = InMemoryExecutionStore::new();
        let exec = execution();
        store.create_execution(&exec, &[]).await.unwrap();
        let err = store.create_execution(&exec, &[]).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_task_update_bumps_execution_heartbeat() {
        let store = InMemoryExecutionStore::new();
        let mut exec = execution();
        exec.updated_at = Utc::now() - chrono::Duration::hours(1);
        store
            .create_execution(&exec, &[TaskResult::pending("a")])
            .await
            .unwrap();

        let mut result = TaskResult::pending("a");
        result.mark_running();
        store.update_task_result(&exec.id, &result).await.unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert!(loaded.updated_at > exec.updated_at);
        let tasks = store.list_task_results(&exec.id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_task_update_is_not_found() {
        let store = InMemoryExecutionStore::new();
        let exec = execution();
        store.create_execution(&exec, &[]).await.unwrap();
        let err = store
            .update_task_result(&exec.id, &TaskResult::pending("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_workflow_versions_are_immutable() {
        let store = InMemoryExecutionStore::new();
        let wf = Workflow::new("wf", vec![TaskSpec::new("a", "echo", "run")]);
        store.save_workflow(&wf).await.unwrap();
        store.save_workflow(&wf).await.unwrap();

        let changed = Workflow::new("wf", vec![TaskSpec::new("b", "echo", "run")]);
        let err = store.save_workflow(&changed).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let loaded = store
            .get_workflow("wf", &Version::new(1, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.tasks[0].id, "a");
    }

    #[tokio::test]
    async fn test_list_by_status_filters() {
        let store = InMemoryExecutionStore::new();
        let a = execution();
        let b = execution();
        store.create_execution(&a, &[]).await.unwrap();
        store.create_execution(&b, &[]).await.unwrap();
        store
            .update_execution(&b.id, &ExecutionPatch::status(ExecutionStatus::Running))
            .await
            .unwrap();

        let running = store
            .list_executions_by_status(&[ExecutionStatus::Running])
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);
    }
}
