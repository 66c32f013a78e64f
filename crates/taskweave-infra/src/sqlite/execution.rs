//! SQLite execution store implementation.
//!
//! Implements `ExecutionStore` from `taskweave-core` using sqlx with split
//! read/write pools. Workflow definitions are stored as JSON blobs keyed by
//! `(id, version)`. Executions and their task results live in `executions`
//! and `task_results`; an execution and its results are created in one
//! transaction.

use chrono::{DateTime, Utc};
use semver::Version;
use serde_json::Value;
use sqlx::Row;
use taskweave_core::repository::execution::ExecutionStore;
use taskweave_types::capability::ErrorCategory;
use taskweave_types::error::RepositoryError;
use taskweave_types::execution::{
    Execution, ExecutionPatch, ExecutionStatus, TaskResult, TaskStatus, TriggerType,
};
use taskweave_types::workflow::Workflow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for SqliteExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutionStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, status, triggered_by, trigger_type, \
     chain_depth, parent_execution_id, variables, steps_completed, total_steps, \
     started_at, completed_at, updated_at, error_message";

const TASK_COLUMNS: &str = "task_id, status, output, error, error_category, attempt_count, started_at, finished_at";

struct ExecutionRow {
    id: String,
    workflow_id: String,
    workflow_version: String,
    status: String,
    triggered_by: String,
    trigger_type: String,
    chain_depth: i64,
    parent_execution_id: Option<String>,
    variables: String,
    steps_completed: i64,
    total_steps: i64,
    started_at: String,
    completed_at: Option<String>,
    updated_at: String,
    error_message: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            triggered_by: row.try_get("triggered_by")?,
            trigger_type: row.try_get("trigger_type")?,
            chain_depth: row.try_get("chain_depth")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            variables: row.try_get("variables")?,
            steps_completed: row.try_get("steps_completed")?,
            total_steps: row.try_get("total_steps")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let variables = serde_json::from_str(&self.variables)
            .map_err(|e| RepositoryError::Query(format!("invalid variables JSON: {e}")))?;
        let workflow_version = Version::parse(&self.workflow_version)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow version: {e}")))?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            workflow_version,
            status: parse_enum::<ExecutionStatus>(&self.status, "execution status")?,
            triggered_by: self.triggered_by,
            trigger_type: parse_enum::<TriggerType>(&self.trigger_type, "trigger type")?,
            chain_depth: self.chain_depth as u32,
            parent_execution_id: self
                .parent_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            variables,
            steps_completed: self.steps_completed as u32,
            total_steps: self.total_steps as u32,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
            error_message: self.error_message,
        })
    }
}

struct TaskResultRow {
    task_id: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    error_category: Option<String>,
    attempt_count: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TaskResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            error_category: row.try_get("error_category")?,
            attempt_count: row.try_get("attempt_count")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_task_result(self) -> Result<TaskResult, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str::<Value>(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid task output: {e}")))
            })
            .transpose()?;

        Ok(TaskResult {
            task_id: self.task_id,
            status: parse_enum::<TaskStatus>(&self.status, "task status")?,
            output,
            error: self.error,
            error_category: self.error_category.map(ErrorCategory::from),
            attempt_count: self.attempt_count as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a snake_case status string through its serde representation.
fn parse_enum<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn to_json(value: &impl serde::Serialize) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(query_err)
}

async fn fetch_execution<'e, E>(executor: E, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?"))
        .bind(execution_id.to_string())
        .fetch_optional(executor)
        .await
        .map_err(query_err)?;

    match row {
        Some(row) => {
            let r = ExecutionRow::from_row(&row).map_err(query_err)?;
            Ok(Some(r.into_execution()?))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// ExecutionStore impl
// ---------------------------------------------------------------------------

impl ExecutionStore for SqliteExecutionStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let version = workflow.version.to_string();
        if let Some(existing) = self.get_workflow(&workflow.id, &workflow.version).await? {
            if existing != *workflow {
                return Err(RepositoryError::Conflict(format!(
                    "workflow '{}' version {version} already exists with a different definition",
                    workflow.id
                )));
            }
            return Ok(());
        }

        sqlx::query(
            r#"INSERT INTO workflows (id, version, name, definition, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id, version) DO NOTHING"#,
        )
        .bind(&workflow.id)
        .bind(&version)
        .bind(&workflow.name)
        .bind(to_json(workflow)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
        version: &Version,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ? AND version = ?")
            .bind(workflow_id)
            .bind(version.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let definition: String = row.try_get("definition").map_err(query_err)?;
                let workflow = serde_json::from_str(&definition).map_err(|e| {
                    RepositoryError::Query(format!("invalid workflow definition JSON: {e}"))
                })?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id ASC, created_at ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            let definition: String = row.try_get("definition").map_err(query_err)?;
            workflows.push(serde_json::from_str(&definition).map_err(|e| {
                RepositoryError::Query(format!("invalid workflow definition JSON: {e}"))
            })?);
        }
        Ok(workflows)
    }

    async fn create_execution(
        &self,
        execution: &Execution,
        tasks: &[TaskResult],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(&format!(
            "INSERT INTO executions ({EXECUTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(execution.workflow_version.to_string())
        .bind(execution.status.as_str())
        .bind(&execution.triggered_by)
        .bind(execution.trigger_type.as_str())
        .bind(execution.chain_depth as i64)
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .bind(to_json(&execution.variables)?)
        .bind(execution.steps_completed as i64)
        .bind(execution.total_steps as i64)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.updated_at))
        .bind(&execution.error_message)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            }
            other => query_err(other),
        })?;

        for (position, task) in tasks.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO task_results
                   (execution_id, task_id, position, status, output, error, error_category,
                    attempt_count, started_at, finished_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(execution.id.to_string())
            .bind(&task.task_id)
            .bind(position as i64)
            .bind(task.status.as_str())
            .bind(task.output.as_ref().map(to_json).transpose()?)
            .bind(&task.error)
            .bind(task.error_category.as_ref().map(|c| c.as_str().to_string()))
            .bind(task.attempt_count as i64)
            .bind(task.started_at.as_ref().map(format_datetime))
            .bind(task.finished_at.as_ref().map(format_datetime))
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn update_execution(
        &self,
        execution_id: &Uuid,
        patch: &ExecutionPatch,
    ) -> Result<Execution, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let mut execution = fetch_execution(&mut *tx, execution_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        patch.apply(&mut execution, Utc::now());

        sqlx::query(
            r#"UPDATE executions SET
                 status = ?, variables = ?, steps_completed = ?,
                 completed_at = ?, updated_at = ?, error_message = ?
               WHERE id = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(to_json(&execution.variables)?)
        .bind(execution.steps_completed as i64)
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.updated_at))
        .bind(&execution.error_message)
        .bind(execution_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(execution)
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        fetch_execution(&self.pool.reader, execution_id).await
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status IN ({placeholders}) ORDER BY started_at ASC"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_err)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn update_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let updated = sqlx::query(
            r#"UPDATE task_results SET
                 status = ?, output = ?, error = ?, error_category = ?,
                 attempt_count = ?, started_at = ?, finished_at = ?
               WHERE execution_id = ? AND task_id = ?"#,
        )
        .bind(result.status.as_str())
        .bind(result.output.as_ref().map(to_json).transpose()?)
        .bind(&result.error)
        .bind(result.error_category.as_ref().map(|c| c.as_str().to_string()))
        .bind(result.attempt_count as i64)
        .bind(result.started_at.as_ref().map(format_datetime))
        .bind(result.finished_at.as_ref().map(format_datetime))
        .bind(execution_id.to_string())
        .bind(&result.task_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query("UPDATE executions SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn list_task_results(&self, execution_id: &Uuid) -> Result<Vec<TaskResult>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_results WHERE execution_id = ? ORDER BY position ASC"
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskResultRow::from_row(row).map_err(query_err)?;
            results.push(r.into_task_result()?);
        }
        Ok(results)
    }
}
