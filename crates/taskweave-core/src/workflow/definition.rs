//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `Workflow`, validates structural
//! constraints, and discovers workflow files on disk. Graph checks (unknown
//! dependencies, cycles) are delegated to `DependencyGraph`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use taskweave_types::workflow::Workflow;
use thiserror::Error;

use super::dag::{DependencyGraph, GraphError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn invalid(message: impl Into<String>) -> DefinitionError {
    DefinitionError::Validation(message.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a workflow from YAML.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, DefinitionError> {
    let workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(workflow).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow definition.
///
/// Checks:
/// - id is non-empty and uses only alphanumerics, `-`, `_` and `.`
/// - name is non-empty
/// - at least one task, each with a non-empty id, agent type and action
/// - retry, timeout and fan-out parameters are in range
/// - chain rules name a target and fire only on terminal statuses
/// - task ids are unique, dependencies and `on_error` handlers exist, and
///   the graph is acyclic
pub fn validate_workflow(workflow: &Workflow) -> Result<(), DefinitionError> {
    if workflow.id.is_empty() {
        return Err(invalid("workflow id must not be empty"));
    }
    if !workflow
        .id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(format!(
            "workflow id '{}' contains invalid characters",
            workflow.id
        )));
    }
    if workflow.name.trim().is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if workflow.tasks.is_empty() {
        return Err(invalid("workflow must have at least one task"));
    }

    let mut exports = HashSet::new();
    for task in &workflow.tasks {
        if task.id.is_empty() {
            return Err(invalid("task id must not be empty"));
        }
        if task.agent_type.is_empty() || task.action.is_empty() {
            return Err(invalid(format!(
                "task '{}' must set both agent_type and action",
                task.id
            )));
        }
        if task.timeout_ms == Some(0) {
            return Err(invalid(format!("task '{}' has a zero timeout", task.id)));
        }
        if let Some(retry) = &task.retry {
            if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                return Err(invalid(format!(
                    "task '{}' backoff_multiplier must be >= 1",
                    task.id
                )));
            }
            if retry.base_delay_ms > retry.max_delay_ms {
                return Err(invalid(format!(
                    "task '{}' base_delay_ms exceeds max_delay_ms",
                    task.id
                )));
            }
        }
        if let Some(fan_out) = &task.for_each {
            if fan_out.concurrency == 0 {
                return Err(invalid(format!(
                    "task '{}' for_each concurrency must be >= 1",
                    task.id
                )));
            }
        }
        if let Some(export) = &task.export {
            if export.is_empty() {
                return Err(invalid(format!("task '{}' exports to an empty name", task.id)));
            }
            if !exports.insert(export.as_str()) {
                return Err(invalid(format!(
                    "variable '{export}' is exported by more than one task"
                )));
            }
        }
    }

    for rule in &workflow.chains {
        if rule.target.is_empty() {
            return Err(invalid("chain rule must name a target workflow"));
        }
        if rule.when.is_empty() || rule.when.iter().any(|s| !s.is_terminal()) {
            return Err(invalid(format!(
                "chain rule for '{}' must fire on terminal statuses only",
                rule.target
            )));
        }
    }

    DependencyGraph::build(workflow)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

pub fn load_workflow_file(path: &Path) -> Result<Workflow, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow as YAML, creating parent directories as needed.
pub fn save_workflow_file(path: &Path, workflow: &Workflow) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(workflow)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Find every `.yaml`/`.yml` workflow under `base_dir`, recursively.
///
/// Files that fail to parse or validate are logged and skipped.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, Workflow)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, Workflow)>) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(workflow) => results.push((path, workflow)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taskweave_types::execution::ExecutionStatus;
    use taskweave_types::workflow::{
        Aggregation, ChainRule, FanOutSpec, OnErrorPolicy, RetryPolicy, TaskSpec,
    };

    use super::*;

    const DAILY: &str = r#"
id: daily-ingest
name: Daily ingest
version: 1.2.0
on_error: continue
variables:
  region: eu
tasks:
  - id: fetch
    agent_type: http
    action: get
    parameters:
      url: "https://example.test/{{ workflow.region }}"
    retry:
      maxRetries: 2
      baseDelayMs: 100
      retry_on: [transient, timeout]
  - id: parse
    agent_type: transform
    action: json
    dependsOn: [fetch]
    priority: 5
    condition: "tasks.fetch.output.status == 200"
  - id: notify
    agent_type: mail
    action: send
    depends_on: [parse]
    for_each:
      items: "{{ tasks.parse.output.recipients }}"
      concurrency: 3
      aggregate: count
    export: notified
chains:
  - when: [completed]
    then: weekly-report
    version: "^2"
    with:
      rows: "{{ tasks.parse.output.rows }}"
"#;

    fn task(id: &str) -> TaskSpec {
        TaskSpec::new(id, "builtin", "echo")
    }

    #[test]
    fn test_parse_full_definition() {
        let wf = parse_workflow_yaml(DAILY).expect("should parse");
        assert_eq!(wf.id, "daily-ingest");
        assert_eq!(wf.version, semver::Version::new(1, 2, 0));
        assert_eq!(wf.on_error, OnErrorPolicy::Continue);
        assert_eq!(wf.variables["region"], json!("eu"));

        let fetch = &wf.tasks[0];
        let retry = fetch.retry.as_ref().unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.base_delay_ms, 100);
        assert_eq!(retry.retry_on.as_ref().unwrap().len(), 2);

        assert_eq!(wf.tasks[1].depends_on, vec!["fetch".to_string()]);
        assert_eq!(wf.tasks[1].priority, 5);

        let fan_out = wf.tasks[2].for_each.as_ref().unwrap();
        assert_eq!(fan_out.concurrency, 3);
        assert_eq!(fan_out.aggregate, Aggregation::Count);
        assert_eq!(wf.tasks[2].export.as_deref(), Some("notified"));

        let chain = &wf.chains[0];
        assert_eq!(chain.target, "weekly-report");
        assert_eq!(chain.when, vec![ExecutionStatus::Completed]);
        assert!(chain.version.as_ref().unwrap().matches(&semver::Version::new(2, 3, 0)));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let wf = parse_workflow_yaml(DAILY).unwrap();
        let yaml = serialize_workflow_yaml(&wf).unwrap();
        assert_eq!(parse_workflow_yaml(&yaml).unwrap(), wf);
    }

    #[test]
    fn test_rejects_cycle_with_path() {
        let wf = Workflow::new(
            "loop",
            vec![task("a").depends_on(["b"]), task("b").depends_on(["a"])],
        );
        match validate_workflow(&wf) {
            Err(DefinitionError::Graph(GraphError::CyclicDependency { path })) => {
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_dependency_and_duplicates() {
        let unknown = Workflow::new("u", vec![task("a").depends_on(["ghost"])]);
        assert!(matches!(
            validate_workflow(&unknown),
            Err(DefinitionError::Graph(GraphError::UnknownDependency { .. }))
        ));

        let dup = Workflow::new("d", vec![task("a"), task("a")]);
        assert!(matches!(
            validate_workflow(&dup),
            Err(DefinitionError::Graph(GraphError::DuplicateTask(_)))
        ));
    }

    #[test]
    fn test_rejects_bad_fields() {
        let cases = vec![
            Workflow::new("", vec![task("a")]),
            Workflow::new("bad id!", vec![task("a")]),
            Workflow::new("empty", vec![]),
            Workflow::new("t", vec![TaskSpec::new("a", "", "echo")]),
            Workflow::new("t", vec![task("a").with_timeout_ms(0)]),
            Workflow::new("t", vec![task("a").with_retry(RetryPolicy::new(3, 100, 0.5))]),
            Workflow::new(
                "t",
                vec![task("a").with_for_each(FanOutSpec::over(json!([])).with_concurrency(0))],
            ),
            Workflow::new("t", vec![task("a").with_export("x"), task("b").with_export("x")]),
            Workflow::new("t", vec![task("a")])
                .with_chain(ChainRule::on_completed("next").on(vec![ExecutionStatus::Running])),
        ];
        for wf in cases {
            assert!(
                matches!(validate_workflow(&wf), Err(DefinitionError::Validation(_))),
                "expected validation error for {wf:?}"
            );
        }
    }

    #[test]
    fn test_parse_error() {
        let err = parse_workflow_yaml("id: [unterminated").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let one = Workflow::new("one", vec![task("a")]);
        let two = Workflow::new("two", vec![task("b")]);
        save_workflow_file(&dir.path().join("one.yaml"), &one).unwrap();
        save_workflow_file(&dir.path().join("nested/two.yml"), &two).unwrap();
        std::fs::write(dir.path().join("notes.yaml"), "key: value").unwrap();

        assert_eq!(load_workflow_file(&dir.path().join("one.yaml")).unwrap(), one);
        let found = discover_workflows(dir.path()).unwrap();
        let ids: Vec<&str> = found.iter().map(|(_, wf)| wf.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"one") && ids.contains(&"two"));
    }

    #[test]
    fn test_discover_missing_dir() {
        assert!(discover_workflows(Path::new("/nonexistent/taskweave")).unwrap().is_empty());
    }
}
