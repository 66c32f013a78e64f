//! JEXL evaluation for task conditions and chain rule guards.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of standard transforms.
//! Values are always passed as context objects, never interpolated into
//! the expression source.

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from placeholder resolution and JEXL evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// A placeholder names something that does not exist (yet).
    #[error("unresolved reference '{reference}': {reason}")]
    UnresolvedReference { reference: String, reason: String },

    #[error("malformed expression: {0}")]
    Malformed(String),

    #[error("expression evaluation failed: {0}")]
    Eval(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

impl ExpressionError {
    pub(crate) fn unresolved(reference: &str, reason: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms pre-registered.
///
/// Used for task `condition`s (e.g. `tasks.fetch.output.count > 0`) and
/// chain rule guards (e.g. `execution.status == 'failed'`).
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!Self::truthy(&val)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|v| Self::truthy(&v))
    }

    /// Evaluate and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::Eval(e.to_string()))
    }

    /// JavaScript-like truthiness.
    pub fn truthy(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        json!({
            "workflow": { "env": "Prod", "threshold": 3 },
            "tasks": {
                "fetch": { "status": "succeeded", "output": { "count": 5, "tags": ["a", "b"] } },
                "notify": { "status": "pending", "output": null }
            },
            "execution": { "status": "failed" }
        })
    }

    #[test]
    fn test_comparison_against_task_output() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("tasks.fetch.output.count > workflow.threshold", &ctx())
            .unwrap());
        assert!(!eval
            .evaluate_bool("tasks.fetch.output.count > 10", &ctx())
            .unwrap());
    }

    #[test]
    fn test_string_transforms() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("workflow.env|lower == 'prod'", &ctx()).unwrap());
        assert!(eval
            .evaluate_bool("workflow.env|startsWith('Pr')", &ctx())
            .unwrap());
    }

    #[test]
    fn test_contains_on_arrays() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("tasks.fetch.output.tags|contains('b')", &ctx())
            .unwrap());
    }

    #[test]
    fn test_length_and_not() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("tasks.fetch.output.tags|length == 2", &ctx())
            .unwrap());
        assert!(eval
            .evaluate_bool("tasks.notify.output|not", &ctx())
            .unwrap());
    }

    #[test]
    fn test_chain_style_guard() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("execution.status == 'failed'", &ctx())
            .unwrap());
    }

    #[test]
    fn test_non_object_context_rejected() {
        let eval = ConditionEvaluator::new();
        let err = eval.evaluate_bool("true", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn test_syntax_error_is_eval_error() {
        let eval = ConditionEvaluator::new();
        let err = eval.evaluate_bool("tasks.fetch.output.count >", &ctx()).unwrap_err();
        assert!(matches!(err, ExpressionError::Eval(_)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!ConditionEvaluator::truthy(&Value::Null));
        assert!(!ConditionEvaluator::truthy(&json!(0)));
        assert!(!ConditionEvaluator::truthy(&json!("")));
        assert!(ConditionEvaluator::truthy(&json!("x")));
        assert!(ConditionEvaluator::truthy(&json!([])));
    }
}
