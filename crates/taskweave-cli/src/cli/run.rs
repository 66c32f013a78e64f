//! `run` and `validate`: execute or check a workflow YAML file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

use taskweave_core::workflow::dag::DependencyGraph;
use taskweave_core::workflow::definition::load_workflow_file;
use taskweave_types::event::EngineEvent;
use taskweave_types::execution::{Execution, ExecutionStatus, Trigger};
use taskweave_types::workflow::Workflow;

use super::inspect::{print_execution, print_tasks};
use super::parse_var;
use crate::state::AppState;

fn load(file: &Path) -> Result<Workflow> {
    load_workflow_file(file).with_context(|| format!("Failed to load workflow {}", file.display()))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let workflow = load(file)?;
    let graph = DependencyGraph::build(&workflow)?;
    let order: Vec<&str> = graph
        .topological_order()
        .iter()
        .map(|&idx| graph.task_id(idx))
        .collect();

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": workflow.id,
            "name": workflow.name,
            "version": workflow.version.to_string(),
            "tasks": workflow.tasks.len(),
            "order": order,
            "chains": workflow.chains.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' v{} is valid",
        style("✓").green().bold(),
        style(&workflow.name).cyan(),
        workflow.version
    );
    println!("  Tasks:  {}", workflow.tasks.len());
    println!("  Order:  {}", order.join(" → "));
    if !workflow.chains.is_empty() {
        println!("  Chains: {}", workflow.chains.len());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    vars: &[String],
    register: &[PathBuf],
    json: bool,
    quiet: bool,
) -> Result<()> {
    let workflow = load(file)?;
    for extra in register {
        let target = load(extra)?;
        let registered = state
            .engine
            .register_workflow(target)
            .await
            .with_context(|| format!("Failed to register {}", extra.display()))?;
        tracing::info!(workflow_id = %registered.id, version = %registered.version, "registered chain target");
    }

    let mut variables = HashMap::new();
    for raw in vars {
        let (key, value) = parse_var(raw)?;
        variables.insert(key, value);
    }
    let trigger = Trigger::manual(whoami()).with_variables(variables);

    // Subscribe before submitting so the start event is not missed.
    let mut events = state.engine.subscribe();
    let reaper = state.engine.spawn_reaper();

    let execution_id = state
        .engine
        .submit(&workflow, trigger)
        .await
        .with_context(|| format!("Failed to start workflow '{}'", workflow.id))?;

    let spinner = if json || quiet {
        None
    } else {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        spinner.set_message(format!("Running '{}'...", workflow.name));
        spinner.enable_steady_tick(Duration::from_millis(80));
        Some(spinner)
    };

    let mut chains = ChainTracker::new(execution_id);
    let wait = state.engine.wait(execution_id);
    tokio::pin!(wait);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;
    let mut events_open = true;

    let execution = loop {
        tokio::select! {
            result = &mut wait => break result?,
            event = events.recv(), if events_open => match event {
                Ok(event) => {
                    chains.observe(&event);
                    if let (Some(spinner), Some(message)) = (&spinner, describe_event(execution_id, &event)) {
                        spinner.set_message(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress display lagged behind engine events");
                }
                Err(RecvError::Closed) => events_open = false,
            },
            _ = &mut ctrl_c, if !cancel_requested => {
                cancel_requested = true;
                if let Some(spinner) = &spinner {
                    spinner.set_message("Cancelling...");
                }
                state.engine.cancel(execution_id).await?;
            }
        }
    };

    // Chained executions start before their parent reports done, so their
    // trigger events are already queued.
    let mut chained = Vec::new();
    chains.drain(&mut events);
    while let Some(child) = chains.next_pending() {
        if let Some(spinner) = &spinner {
            spinner.set_message(format!("Waiting for chained execution {child}..."));
        }
        chained.push(state.engine.wait(child).await?);
        chains.drain(&mut events);
    }

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    state.engine.shutdown();
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "stale execution reaper ended abnormally");
    }

    let tasks = state.engine.get_execution_tasks(execution_id).await?;
    let stats = state.engine.stats();

    if json {
        let out = serde_json::json!({
            "execution": execution,
            "tasks": tasks,
            "chained": chained,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !quiet {
        print_execution(&execution);
        print_tasks(&tasks);
        print_chained(&chained);
        println!(
            "  {}",
            style(format!(
                "Engine: {} completed, {} failed, {} cancelled",
                stats.completed, stats.failed, stats.cancelled
            ))
            .dim()
        );
        println!();
    }

    if execution.status != ExecutionStatus::Completed {
        bail!(
            "Execution {} finished with status {}",
            execution.id,
            execution.status
        );
    }
    Ok(())
}

/// Follows chain triggers descending from one root execution.
struct ChainTracker {
    family: HashSet<Uuid>,
    pending: Vec<Uuid>,
    next: usize,
}

impl ChainTracker {
    fn new(root: Uuid) -> Self {
        Self {
            family: HashSet::from([root]),
            pending: Vec::new(),
            next: 0,
        }
    }

    fn observe(&mut self, event: &EngineEvent) {
        if let EngineEvent::ChainTriggered {
            parent_execution_id,
            execution_id,
            ..
        } = event
        {
            if self.family.contains(parent_execution_id) && self.family.insert(*execution_id) {
                self.pending.push(*execution_id);
            }
        }
    }

    /// Consume every event already queued on `events`.
    fn drain(&mut self, events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) {
        loop {
            match events.try_recv() {
                Ok(event) => self.observe(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "chain tracking lagged; some chained executions may not be awaited");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn next_pending(&mut self) -> Option<Uuid> {
        let id = self.pending.get(self.next).copied()?;
        self.next += 1;
        Some(id)
    }
}

fn print_chained(chained: &[Execution]) {
    if chained.is_empty() {
        return;
    }
    println!("  {}", style("── Chained ──").dim());
    for execution in chained {
        println!(
            "  {} '{}' → {}",
            execution.id,
            execution.workflow_id,
            execution.status
        );
    }
    println!();
}

/// One-line progress message for events belonging to `execution_id`.
fn describe_event(execution_id: Uuid, event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::TaskStarted {
            execution_id: id,
            task_id,
            capability,
        } if *id == execution_id => Some(format!("{task_id}: running ({capability})")),
        EngineEvent::TaskRetrying {
            execution_id: id,
            task_id,
            attempt,
            delay_ms,
            error,
        } if *id == execution_id => Some(format!(
            "{task_id}: attempt {attempt} failed ({error}), retrying in {delay_ms}ms"
        )),
        EngineEvent::TaskSucceeded {
            execution_id: id,
            task_id,
            duration_ms,
            ..
        } if *id == execution_id => Some(format!("{task_id}: succeeded in {duration_ms}ms")),
        EngineEvent::TaskFailed {
            execution_id: id,
            task_id,
            error,
            ..
        } if *id == execution_id => Some(format!("{task_id}: failed ({error})")),
        EngineEvent::TaskSkipped {
            execution_id: id,
            task_id,
            reason,
        } if *id == execution_id => Some(format!("{task_id}: skipped ({reason})")),
        EngineEvent::ChainTriggered {
            parent_execution_id,
            workflow_id,
            ..
        } if *parent_execution_id == execution_id => {
            Some(format!("chained '{workflow_id}' started"))
        }
        _ => None,
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use taskweave_core::repository::execution::ExecutionStore;
    use taskweave_types::workflow::TaskSpec;

    use crate::builtins::BUILTIN_AGENT_TYPE;

    async fn temp_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init(Some(dir.path().to_path_buf()), None, |config| {
            config.default_retry.base_delay_ms = 1;
        })
        .await
        .unwrap();
        (dir, state)
    }

    fn write_workflow(dir: &Path, yaml: &str) -> PathBuf {
        write_named(dir, "flow.yaml", yaml)
    }

    fn write_named(dir: &Path, name: &str, yaml: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn describe_event_filters_by_execution() {
        let mine = Uuid::now_v7();
        let other = Uuid::now_v7();
        let started = |id| EngineEvent::TaskStarted {
            execution_id: id,
            task_id: "fetch".to_string(),
            capability: "builtin".to_string(),
        };
        assert_eq!(
            describe_event(mine, &started(mine)).as_deref(),
            Some("fetch: running (builtin)")
        );
        assert!(describe_event(mine, &started(other)).is_none());
    }

    #[test]
    fn chain_tracker_follows_descendants_once() {
        let root = Uuid::now_v7();
        let child = Uuid::now_v7();
        let grandchild = Uuid::now_v7();
        let stranger = Uuid::now_v7();
        let trigger = |parent, id| EngineEvent::ChainTriggered {
            parent_execution_id: parent,
            execution_id: id,
            workflow_id: "next".to_string(),
            chain_depth: 1,
        };

        let mut tracker = ChainTracker::new(root);
        tracker.observe(&trigger(root, child));
        tracker.observe(&trigger(root, child));
        tracker.observe(&trigger(stranger, Uuid::now_v7()));
        assert_eq!(tracker.next_pending(), Some(child));
        tracker.observe(&trigger(child, grandchild));
        assert_eq!(tracker.next_pending(), Some(grandchild));
        assert_eq!(tracker.next_pending(), None);
    }

    #[test]
    fn validate_rejects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_workflow(
            dir.path(),
            r#"
id: loop
name: Loop
tasks:
  - id: a
    agent_type: builtin
    action: echo
    depends_on: [b]
  - id: b
    agent_type: builtin
    action: echo
    depends_on: [a]
"#,
        );
        assert!(handle_validate(&path, true).is_err());
    }

    #[tokio::test]
    async fn run_persists_execution_with_overrides() {
        let (dir, state) = temp_state().await;
        let path = write_workflow(
            dir.path(),
            r#"
id: greet
name: Greet
variables:
  who: world
tasks:
  - id: hello
    agent_type: builtin
    action: echo
    parameters:
      greeting: "hello {{ workflow.who }}"
  - id: retry
    agent_type: builtin
    action: flaky
    depends_on: [hello]
    parameters:
      key: greet-retry
      failures: 1
"#,
        );

        handle_run(&state, &path, &["who=tester".to_string()], &[], true, true)
            .await
            .unwrap();

        let workflow = load(&path).unwrap();
        assert_eq!(workflow.tasks[0].agent_type, BUILTIN_AGENT_TYPE);
        let stored = state
            .engine
            .state()
            .store()
            .list_executions_by_status(&[ExecutionStatus::Completed])
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].variables["who"], serde_json::json!("tester"));

        let tasks = state.engine.get_execution_tasks(stored[0].id).await.unwrap();
        assert_eq!(
            tasks[0].output,
            Some(serde_json::json!({ "greeting": "hello tester" }))
        );
        assert_eq!(tasks[1].attempt_count, 2);
    }

    #[tokio::test]
    async fn run_reports_failed_execution() {
        let (dir, state) = temp_state().await;
        let workflow = Workflow::new(
            "broken",
            vec![
                TaskSpec::new("boom", BUILTIN_AGENT_TYPE, "fail")
                    .with_param("category", serde_json::json!("invalid_input")),
            ],
        );
        let yaml = taskweave_core::workflow::definition::serialize_workflow_yaml(&workflow).unwrap();
        let path = write_workflow(dir.path(), &yaml);

        let err = handle_run(&state, &path, &[], &[], true, true).await.unwrap_err();
        assert!(err.to_string().contains("finished with status failed"));
    }

    #[tokio::test]
    async fn run_waits_for_registered_chain_target() {
        let (dir, state) = temp_state().await;
        let target = write_named(
            dir.path(),
            "report.yaml",
            r#"
id: report
name: Report
tasks:
  - id: summarize
    agent_type: builtin
    action: echo
    parameters:
      source: "{{ workflow.source }}"
"#,
        );
        let path = write_workflow(
            dir.path(),
            r#"
id: ingest
name: Ingest
tasks:
  - id: load
    agent_type: builtin
    action: echo
    parameters:
      rows: 3
chains:
  - then: report
    with:
      source: "{{ workflow.origin }}"
variables:
  origin: nightly
"#,
        );

        handle_run(&state, &path, &[], &[target], true, true)
            .await
            .unwrap();

        let completed = state
            .engine
            .state()
            .store()
            .list_executions_by_status(&[ExecutionStatus::Completed])
            .await
            .unwrap();
        let report = completed
            .iter()
            .find(|e| e.workflow_id == "report")
            .expect("chained execution completed");
        assert_eq!(report.chain_depth, 1);
        assert_eq!(report.variables["source"], serde_json::json!("nightly"));
    }
}
