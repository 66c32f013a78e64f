//! Placeholder resolution for task parameters.
//!
//! `ResolutionContext` holds what a task may reference at dispatch time: the
//! execution variables, the results of other tasks, and (inside a fan-out)
//! the current element. String leaves of a parameter tree may contain
//! `{{ ... }}` placeholders:
//!
//! - `{{ workflow.<var>[.path] }}` -- execution variable
//! - `{{ tasks.<id>.output[.path] }}` -- output of a succeeded task
//! - `{{ tasks.<id>.status }}` / `attempt_count` / `error` -- any task,
//!   so a fallback handler can read what went wrong
//! - `{{ item[.path] }}`, `{{ index }}` -- fan-out element and position
//!
//! A string that is exactly one placeholder resolves to the referenced value
//! with its JSON type intact; placeholders embedded in text are stringified.
//! Placeholders nest (`{{ tasks.{{ workflow.source }}.output }}`) and the
//! innermost resolves first. Missing keys below a root resolve to `null`;
//! the root itself (namespace, task id, fan-out scope) must exist.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use taskweave_types::execution::{TaskResult, TaskStatus};

use super::expression::ExpressionError;

// ---------------------------------------------------------------------------
// ResolutionContext
// ---------------------------------------------------------------------------

/// Snapshot of the values a task's placeholders may reference.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    variables: HashMap<String, Value>,
    tasks: HashMap<String, TaskResult>,
    item: Option<(Value, usize)>,
}

impl ResolutionContext {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            tasks: HashMap::new(),
            item: None,
        }
    }

    /// Make task results referenceable. Only `succeeded` ones resolve.
    pub fn with_task_results<'a>(mut self, results: impl IntoIterator<Item = &'a TaskResult>) -> Self {
        for result in results {
            self.tasks.insert(result.task_id.clone(), result.clone());
        }
        self
    }

    /// Scope for one fan-out element.
    pub fn with_item(&self, item: Value, index: usize) -> Self {
        Self {
            variables: self.variables.clone(),
            tasks: self.tasks.clone(),
            item: Some((item, index)),
        }
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Resolve every placeholder in `value`, recursing into arrays and objects.
    /// Object keys are never resolved.
    pub fn resolve(&self, value: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.resolve_map(map).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    pub fn resolve_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>, ExpressionError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect()
    }

    /// Resolve a single string.
    pub fn resolve_str(&self, input: &str) -> Result<Value, ExpressionError> {
        if !input.contains("{{") {
            return Ok(Value::String(input.to_string()));
        }
        let segments = parse_segments(input)?;
        if let [Segment::Placeholder(inner)] = segments.as_slice() {
            return self.evaluate_placeholder(inner);
        }
        let mut out = String::with_capacity(input.len());
        for segment in &segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(inner) => {
                    out.push_str(&value_to_string(&self.evaluate_placeholder(inner)?));
                }
            }
        }
        Ok(Value::String(out))
    }

    /// JSON object handed to JEXL conditions:
    /// `{ workflow, tasks: { id: { status, output } }, item?, index? }`.
    pub fn to_expression_context(&self) -> Value {
        let tasks: Map<String, Value> = self
            .tasks
            .iter()
            .map(|(id, result)| {
                (
                    id.clone(),
                    json!({
                        "status": result.status.as_str(),
                        "output": result.output.clone().unwrap_or(Value::Null),
                    }),
                )
            })
            .collect();
        let mut context = json!({
            "workflow": self.variables,
            "tasks": tasks,
        });
        if let (Some((item, index)), Some(obj)) = (&self.item, context.as_object_mut()) {
            obj.insert("item".to_string(), item.clone());
            obj.insert("index".to_string(), json!(index));
        }
        context
    }

    fn evaluate_placeholder(&self, inner: &[Segment]) -> Result<Value, ExpressionError> {
        let mut reference = String::new();
        for segment in inner {
            match segment {
                Segment::Text(text) => reference.push_str(text),
                Segment::Placeholder(nested) => {
                    reference.push_str(&value_to_string(&self.evaluate_placeholder(nested)?));
                }
            }
        }
        self.lookup(reference.trim())
    }

    fn lookup(&self, reference: &str) -> Result<Value, ExpressionError> {
        if reference.is_empty() {
            return Err(ExpressionError::Malformed("empty placeholder".to_string()));
        }
        let mut parts = reference.split('.');
        let root = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match root {
            "workflow" | "variables" => match rest.split_first() {
                None => Ok(json!(self.variables)),
                Some((name, path)) => Ok(self
                    .variables
                    .get(*name)
                    .map(|v| descend(v, path))
                    .unwrap_or(Value::Null)),
            },
            "tasks" => {
                let Some((task_id, path)) = rest.split_first() else {
                    return Err(ExpressionError::Malformed(format!(
                        "'{reference}' is missing a task id"
                    )));
                };
                let result = self.tasks.get(*task_id).ok_or_else(|| {
                    ExpressionError::unresolved(reference, format!("no task named '{task_id}'"))
                })?;
                let metadata = matches!(
                    path.first().copied(),
                    Some("status" | "attempt_count" | "attempts" | "error")
                );
                if !metadata && result.status != TaskStatus::Succeeded {
                    return Err(ExpressionError::unresolved(
                        reference,
                        format!("task '{task_id}' has not succeeded (status: {})", result.status),
                    ));
                }
                Ok(task_field(result, path))
            }
            "item" => match &self.item {
                Some((item, _)) => Ok(descend(item, &rest)),
                None => Err(ExpressionError::unresolved(
                    reference,
                    "'item' is only available inside for_each",
                )),
            },
            "index" => match &self.item {
                Some((_, index)) if rest.is_empty() => Ok(json!(index)),
                Some(_) => Ok(Value::Null),
                None => Err(ExpressionError::unresolved(
                    reference,
                    "'index' is only available inside for_each",
                )),
            },
            other => Err(ExpressionError::unresolved(
                reference,
                format!("unknown namespace '{other}'"),
            )),
        }
    }
}

fn task_field(result: &TaskResult, path: &[&str]) -> Value {
    let Some((field, rest)) = path.split_first() else {
        return json!({
            "status": result.status.as_str(),
            "output": result.output.clone().unwrap_or(Value::Null),
            "attempt_count": result.attempt_count,
        });
    };
    match *field {
        "output" => result
            .output
            .as_ref()
            .map(|v| descend(v, rest))
            .unwrap_or(Value::Null),
        "status" if rest.is_empty() => json!(result.status.as_str()),
        "attempt_count" | "attempts" if rest.is_empty() => json!(result.attempt_count),
        "error" if rest.is_empty() => result.error.clone().map(Value::String).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Walk object keys / array indices; anything missing yields `null`.
fn descend(value: &Value, path: &[&str]) -> Value {
    let mut current = value;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(*segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Convert a JSON value to the text substituted into a larger string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Placeholder(Vec<Segment>),
}

/// Split a string into literal text and (possibly nested) placeholders.
/// A stray `}}` outside any placeholder is literal text.
fn parse_segments(input: &str) -> Result<Vec<Segment>, ExpressionError> {
    let mut stack: Vec<Vec<Segment>> = vec![Vec::new()];
    let mut text = String::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("{{") {
            flush_text(&mut stack, &mut text);
            stack.push(Vec::new());
            rest = after;
        } else if let (Some(after), true) = (rest.strip_prefix("}}"), stack.len() > 1) {
            flush_text(&mut stack, &mut text);
            if let Some(inner) = stack.pop() {
                if let Some(parent) = stack.last_mut() {
                    parent.push(Segment::Placeholder(inner));
                }
            }
            rest = after;
        } else if let Some(ch) = rest.chars().next() {
            text.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }

    if stack.len() > 1 {
        return Err(ExpressionError::Malformed(format!(
            "unclosed placeholder in '{input}'"
        )));
    }
    flush_text(&mut stack, &mut text);
    Ok(stack.pop().unwrap_or_default())
}

fn flush_text(stack: &mut [Vec<Segment>], text: &mut String) {
    if text.is_empty() {
        return;
    }
    if let Some(top) = stack.last_mut() {
        top.push(Segment::Text(std::mem::take(text)));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
