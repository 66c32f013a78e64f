//! Read-only and maintenance commands over persisted executions:
//! `status`, `tasks`, `active` and `cleanup`.

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use uuid::Uuid;

use taskweave_types::execution::{Execution, ExecutionStatus, TaskResult, TaskStatus};

use crate::state::AppState;

fn parse_execution_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid execution id"))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let execution = state
        .engine
        .get_execution(execution_id)
        .await
        .with_context(|| format!("Failed to load execution {execution_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_execution(&execution);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub async fn handle_tasks(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let tasks = state
        .engine
        .get_execution_tasks(execution_id)
        .await
        .with_context(|| format!("Failed to load tasks of execution {execution_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        print_tasks(&tasks);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Active
// ---------------------------------------------------------------------------

pub async fn handle_active(state: &AppState, json: bool) -> Result<()> {
    let ids = state
        .engine
        .list_active_executions()
        .await
        .context("Failed to list active executions")?;

    let mut executions = Vec::with_capacity(ids.len());
    for id in ids {
        executions.push(state.engine.get_execution(id).await?);
    }

    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "execution_id": e.id.to_string(),
                    "workflow_id": e.workflow_id,
                    "workflow_version": e.workflow_version.to_string(),
                    "status": e.status,
                    "steps_completed": e.steps_completed,
                    "total_steps": e.total_steps,
                    "started_at": e.started_at.to_rfc3339(),
                    "updated_at": e.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No active executions.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Last update"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(format!("{}@{}", e.workflow_id, e.workflow_version)),
            Cell::new(e.status).fg(execution_color(e.status)),
            Cell::new(format!("{}/{}", e.steps_completed, e.total_steps)),
            Cell::new(e.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

pub async fn handle_cleanup(
    state: &AppState,
    max_age_secs: Option<u64>,
    yes: bool,
    json: bool,
) -> Result<()> {
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.stale_timeout());

    if !yes && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Fail every running execution with no progress for {}?",
                style(format!("{max_age:?}")).yellow()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let reclaimed = state
        .engine
        .state()
        .cleanup_stale(max_age)
        .await
        .context("Failed to sweep stale executions")?;

    if json {
        let ids: Vec<String> = reclaimed.iter().map(Uuid::to_string).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "reclaimed": ids }))?
        );
        return Ok(());
    }

    println!();
    if reclaimed.is_empty() {
        println!("  No stale executions.");
    } else {
        println!(
            "  {} Reclaimed {} stale execution(s):",
            style("✓").green().bold(),
            reclaimed.len()
        );
        for id in &reclaimed {
            println!("    {}", style(id).dim());
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn print_execution(execution: &Execution) {
    let status = match execution.status {
        ExecutionStatus::Completed => style(execution.status.as_str()).green().bold(),
        ExecutionStatus::Failed => style(execution.status.as_str()).red().bold(),
        ExecutionStatus::Cancelled => style(execution.status.as_str()).yellow().bold(),
        _ => style(execution.status.as_str()).cyan(),
    };

    println!();
    println!(
        "  Execution {} of '{}' v{}",
        style(execution.id).bold(),
        style(&execution.workflow_id).cyan(),
        execution.workflow_version
    );
    println!("  Status:    {status}");
    println!(
        "  Steps:     {}/{}",
        execution.steps_completed, execution.total_steps
    );
    println!(
        "  Trigger:   {} by {}",
        execution.trigger_type, execution.triggered_by
    );
    if let Some(parent) = execution.parent_execution_id {
        println!(
            "  Parent:    {} (chain depth {})",
            parent, execution.chain_depth
        );
    }
    println!(
        "  Started:   {}",
        execution.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(ms) = execution.duration_ms() {
        println!("  Duration:  {}", format_duration_ms(ms));
    }
    if let Some(error) = &execution.error_message {
        println!("  Error:     {}", style(error).red());
    }
    println!();
}

pub fn print_tasks(tasks: &[TaskResult]) {
    if tasks.is_empty() {
        println!("  No tasks.");
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for task in tasks {
        let duration = match (task.started_at, task.finished_at) {
            (Some(start), Some(end)) => format_duration_ms((end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        let error = match (&task.error, &task.error_category) {
            (Some(error), Some(category)) => format!("[{category}] {error}"),
            (Some(error), None) => error.clone(),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(&task.task_id),
            Cell::new(task.status).fg(task_color(task.status)),
            Cell::new(task.attempt_count),
            Cell::new(duration),
            Cell::new(error),
        ]);
    }

    println!("{table}");
    println!();
}

fn execution_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::Yellow,
        ExecutionStatus::Pending | ExecutionStatus::Running => Color::Cyan,
    }
}

fn task_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Succeeded => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Skipped => Color::DarkGrey,
        _ => Color::Cyan,
    }
}

pub fn format_duration_ms(ms: i64) -> String {
    if ms >= 60_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    } else if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_ms() {
        assert_eq!(format_duration_ms(42), "42ms");
        assert_eq!(format_duration_ms(1500), "1.5s");
        assert_eq!(format_duration_ms(125_000), "2m05s");
    }

    #[test]
    fn test_parse_execution_id() {
        let id = Uuid::now_v7();
        assert_eq!(parse_execution_id(&id.to_string()).unwrap(), id);
        assert!(parse_execution_id("not-a-uuid").is_err());
    }
}
