//! Fan-out / fan-in over a collection.
//!
//! Elements are processed in consecutive batches of `concurrency`. Every
//! element in a batch is started together and the whole batch settles before
//! the next one begins, so at most `concurrency` invocations are ever in
//! flight. With `fail_fast`, a batch containing a failure is the last one
//! started; the remaining elements are reported as skipped.

use std::fmt::Display;
use std::future::Future;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use taskweave_types::workflow::Aggregation;

// ---------------------------------------------------------------------------
// Element results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome for one element of the source collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementResult {
    pub index: usize,
    pub status: ElementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ElementResult {
    fn skipped(index: usize) -> Self {
        Self {
            index,
            status: ElementStatus::Skipped,
            output: None,
            error: None,
        }
    }
}

/// Settled results of a fan-out, in source order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FanOutResult {
    pub results: Vec<ElementResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl FanOutResult {
    /// Outputs of succeeded elements, in source order.
    pub fn outputs(&self) -> impl Iterator<Item = &Value> {
        self.results
            .iter()
            .filter(|r| r.status == ElementStatus::Succeeded)
            .filter_map(|r| r.output.as_ref())
    }

    /// Whether the fan-out as a whole counts as failed.
    pub fn is_failure(&self, fail_fast: bool) -> bool {
        self.failed > 0 && (fail_fast || self.succeeded == 0)
    }

    /// Combine succeeded outputs with a built-in aggregator.
    pub fn aggregate(&self, aggregation: Aggregation) -> Value {
        match aggregation {
            Aggregation::Collect => Value::Array(self.outputs().cloned().collect()),
            Aggregation::Count => json!(self.succeeded),
            Aggregation::Concat => {
                let mut flat = Vec::new();
                for output in self.outputs() {
                    match output {
                        Value::Array(items) => flat.extend(items.iter().cloned()),
                        other => flat.push(other.clone()),
                    }
                }
                Value::Array(flat)
            }
            Aggregation::Merge => {
                let mut merged = Map::new();
                for output in self.outputs() {
                    if let Value::Object(obj) = output {
                        for (k, v) in obj {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                }
                Value::Object(merged)
            }
            Aggregation::Sum => {
                let numbers: Vec<&serde_json::Number> =
                    self.outputs().filter_map(|v| v.as_number()).collect();
                if numbers.iter().all(|n| n.is_i64()) {
                    json!(numbers.iter().filter_map(|n| n.as_i64()).sum::<i64>())
                } else {
                    json!(numbers.iter().filter_map(|n| n.as_f64()).sum::<f64>())
                }
            }
        }
    }

    /// Combine results with a caller-supplied aggregator.
    pub fn aggregate_with<F>(&self, f: F) -> Value
    where
        F: FnOnce(&[ElementResult]) -> Value,
    {
        f(&self.results)
    }

    /// Task output: `{ results, succeeded, failed, aggregate }`.
    pub fn to_output(&self, aggregation: Aggregation) -> Value {
        json!({
            "results": self.results,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "aggregate": self.aggregate(aggregation),
        })
    }

    /// First element error, for the task's error message.
    pub fn first_error(&self) -> Option<&str> {
        self.results.iter().find_map(|r| r.error.as_deref())
    }
}

// ---------------------------------------------------------------------------
// FanOut
// ---------------------------------------------------------------------------

pub struct FanOut;

impl FanOut {
    /// Invoke `invoke(index, item)` for every element, `concurrency` at a time.
    pub async fn run<F, Fut, E>(
        items: Vec<Value>,
        concurrency: usize,
        fail_fast: bool,
        invoke: F,
    ) -> FanOutResult
    where
        F: Fn(usize, Value) -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        let batch_size = concurrency.max(1);
        let total = items.len();
        let mut out = FanOutResult {
            results: Vec::with_capacity(total),
            ..FanOutResult::default()
        };

        let mut next = 0;
        while next < total {
            let end = (next + batch_size).min(total);
            let batch = (next..end).map(|index| {
                let fut = invoke(index, items[index].clone());
                async move { (index, fut.await) }
            });

            let mut batch_failed = false;
            for (index, result) in join_all(batch).await {
                let element = match result {
                    Ok(output) => {
                        out.succeeded += 1;
                        ElementResult {
                            index,
                            status: ElementStatus::Succeeded,
                            output: Some(output),
                            error: None,
                        }
                    }
                    Err(e) => {
                        out.failed += 1;
                        batch_failed = true;
                        ElementResult {
                            index,
                            status: ElementStatus::Failed,
                            output: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                out.results.push(element);
            }
            next = end;

            if fail_fast && batch_failed {
                tracing::debug!(remaining = total - next, "fan-out aborted after failure");
                out.results.extend((next..total).map(ElementResult::skipped));
                break;
            }
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
