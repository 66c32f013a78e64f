//! Task pool: the per-execution scheduler.
//!
//! One coordinator owns every `TaskResult` and the execution variables.
//! Workers run invocations on a `JoinSet` and report back via their join
//! handles; retry notices arrive on an mpsc channel. The coordinator:
//!
//! 1. Skips pending tasks blocked by a failed or skipped dependency.
//! 2. Computes the ready set (pending tasks whose dependencies all succeeded).
//! 3. Orders it by descending priority, stable on definition order.
//! 4. Starts tasks until `max_concurrency` are in flight. Starting a task
//!    evaluates its condition and resolves its parameters against the
//!    results recorded so far.
//! 5. Waits for a completion, a retry notice, or cancellation, then loops.
//!
//! Under `on_error: stop` the dependents of a failed task are skipped as soon
//! as it fails. Under `continue` a blocked task is skipped once all of its
//! dependencies are terminal. Independent branches run to completion under
//! both policies.
//!
//! A fallback handler (a task named by another task's `on_error`) becomes
//! ready once every task naming it is terminal and at least one of them
//! failed; otherwise it is skipped. A failure whose handler succeeds does not
//! fail the execution.
//!
//! `max_concurrency` bounds capability calls, not tasks: a fan-out task holds
//! one slot per element it runs in parallel.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use serde_json::Value;
use taskweave_types::capability::{CapabilityError, ErrorCategory};
use taskweave_types::event::EngineEvent;
use taskweave_types::execution::{ExecutionStatus, TaskResult, TaskStatus};
use taskweave_types::workflow::{FanOutSpec, OnErrorPolicy, TaskSpec, Workflow};
use tokio::sync::{mpsc, watch};
use tokio::task::{Id as WorkerId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;

use super::dag::DependencyGraph;
use super::expression::{ConditionEvaluator, ExpressionError};
use super::fanout::FanOut;
use super::resolver::ResolutionContext;
use super::retry::{InvocationError, RetryNotice, TaskInvoker};
use super::state::StateError;

/// Reason recorded on tasks that never started because of cancellation.
pub const CANCELLED_REASON: &str = "execution cancelled";

// ---------------------------------------------------------------------------
// TaskResultSink
// ---------------------------------------------------------------------------

/// Where the coordinator persists task transitions.
///
/// A failing sink aborts the pool: in-flight workers are dropped and the
/// error is returned in `PoolOutcome::aborted`.
pub trait TaskResultSink: Send + Sync {
    fn record(
        &self,
        result: &TaskResult,
    ) -> impl Future<Output = Result<(), StateError>> + Send;

    /// Called after every task success.
    fn checkpoint(
        &self,
        steps_completed: u32,
        variables: &HashMap<String, Value>,
    ) -> impl Future<Output = Result<(), StateError>> + Send;
}

// ---------------------------------------------------------------------------
// PoolOutcome
// ---------------------------------------------------------------------------

/// Final state of one pool run.
#[derive(Debug, Clone)]
pub struct PoolOutcome {
    /// Task results in definition order.
    pub results: Vec<TaskResult>,
    pub variables: HashMap<String, Value>,
    pub steps_completed: u32,
    /// Error of the first failure no fallback handled, excluding cancellation.
    pub first_error: Option<String>,
    /// Failed tasks whose fallback handler succeeded.
    pub handled: Vec<String>,
    pub cancelled: bool,
    pub aborted: Option<StateError>,
}

impl PoolOutcome {
    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|r| r.status == TaskStatus::Failed)
    }

    /// Failed tasks not covered by a successful fallback.
    pub fn unhandled_failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == TaskStatus::Failed && !self.handled.contains(&r.task_id))
            .count()
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.cancelled {
            ExecutionStatus::Cancelled
        } else if self.unhandled_failures() > 0 || self.aborted.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    }

    pub fn error_message(&self) -> Option<String> {
        if let Some(aborted) = &self.aborted {
            return Some(aborted.to_string());
        }
        if self.cancelled {
            return Some(CANCELLED_REASON.to_string());
        }
        self.first_error.clone()
    }
}

/// Live task tally of one pool, published after every scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    /// Pending or ready.
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Concurrency slots held by running tasks.
    pub slots_in_use: usize,
}

impl TaskCounts {
    fn tally(results: &[TaskResult], slots_in_use: usize) -> Self {
        let mut counts = Self {
            slots_in_use,
            ..Self::default()
        };
        for result in results {
            match result.status {
                TaskStatus::Pending | TaskStatus::Ready => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Worker messages
// ---------------------------------------------------------------------------

enum Job {
    Single { parameters: Value },
    FanOut {
        items: Vec<Value>,
        context: ResolutionContext,
        spec: FanOutSpec,
        width: usize,
    },
}

struct WorkerOutcome {
    index: usize,
    result: Result<Value, InvocationError>,
    attempts: u32,
}

struct RetryProgress {
    index: usize,
    notice: RetryNotice,
}

struct RunState {
    results: Vec<TaskResult>,
    variables: HashMap<String, Value>,
    started: Vec<Option<Instant>>,
    steps_completed: u32,
    /// Non-cancellation failures in the order they happened.
    failures: Vec<(usize, String)>,
    /// Concurrency slots each running task holds.
    slots: Vec<usize>,
    /// Spawned worker id to task index.
    workers: HashMap<WorkerId, usize>,
    running: usize,
    cancelled: bool,
    aborted: Option<StateError>,
}

// ---------------------------------------------------------------------------
// TaskPool
// ---------------------------------------------------------------------------

/// Scheduler for one execution.
pub struct TaskPool {
    workflow: Arc<Workflow>,
    graph: Arc<DependencyGraph>,
    invoker: Arc<TaskInvoker>,
    evaluator: Arc<ConditionEvaluator>,
    events: EventBus,
    execution_id: Uuid,
    max_concurrency: usize,
    cancel: CancellationToken,
    progress: Option<watch::Sender<TaskCounts>>,
}

impl TaskPool {
    pub fn new(
        workflow: Arc<Workflow>,
        graph: Arc<DependencyGraph>,
        invoker: Arc<TaskInvoker>,
        execution_id: Uuid,
    ) -> Self {
        Self {
            workflow,
            graph,
            invoker,
            evaluator: Arc::new(ConditionEvaluator::new()),
            events: EventBus::default(),
            execution_id,
            max_concurrency: 5,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: watch::Sender<TaskCounts>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run every task to a terminal state.
    pub async fn run<K: TaskResultSink>(self, variables: HashMap<String, Value>, sink: &K) -> PoolOutcome {
        let task_count = self.workflow.tasks.len();
        let mut state = RunState {
            results: self
                .workflow
                .tasks
                .iter()
                .map(|t| TaskResult::pending(t.id.clone()))
                .collect(),
            variables,
            started: vec![None; task_count],
            steps_completed: 0,
            failures: Vec::new(),
            slots: vec![0; task_count],
            workers: HashMap::new(),
            running: 0,
            cancelled: false,
            aborted: None,
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<RetryProgress>();
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() && !state.cancelled {
                state.cancelled = true;
                tracing::info!(execution_id = %self.execution_id, "cancelling execution");
                self.skip_unstarted(&mut state, sink, CANCELLED_REASON).await;
            }
            if !state.cancelled {
                while state.aborted.is_none()
                    && self.advance(&mut state, sink, &mut workers, &progress_tx).await
                {}
            }
            if state.aborted.is_some() {
                break;
            }

            if state.running == 0 {
                if state.results.iter().any(|r| !r.status.is_terminal()) {
                    self.skip_unstarted(&mut state, sink, "dependencies can never be satisfied")
                        .await;
                }
                break;
            }

            self.publish_progress(&state);

            // Retry notices are sent before the backoff sleep, so draining
            // them first keeps them ahead of the same task's completion.
            tokio::select! {
                biased;
                Some(progress) = progress_rx.recv() => {
                    self.on_retry(&mut state, sink, progress).await;
                }
                Some(joined) = workers.join_next_with_id() => match joined {
                    Ok((id, outcome)) => {
                        state.workers.remove(&id);
                        self.on_complete(&mut state, sink, outcome).await;
                    }
                    Err(e) => self.on_worker_lost(&mut state, sink, e).await,
                },
                _ = self.cancel.cancelled(), if !state.cancelled => {}
            }
        }

        if state.aborted.is_some() {
            workers.abort_all();
        }
        self.publish_progress(&state);

        let handled: Vec<usize> = (0..task_count)
            .filter(|&idx| {
                state.results[idx].status == TaskStatus::Failed
                    && self
                        .graph
                        .fallback(idx)
                        .is_some_and(|h| state.results[h].status == TaskStatus::Succeeded)
            })
            .collect();
        let first_error = state
            .failures
            .iter()
            .find(|(idx, _)| !handled.contains(idx))
            .map(|(_, message)| message.clone());

        tracing::debug!(
            execution_id = %self.execution_id,
            steps_completed = state.steps_completed,
            handled = handled.len(),
            cancelled = state.cancelled,
            "task pool finished"
        );

        PoolOutcome {
            results: state.results,
            variables: state.variables,
            steps_completed: state.steps_completed,
            first_error,
            handled: handled
                .into_iter()
                .map(|idx| self.workflow.tasks[idx].id.clone())
                .collect(),
            cancelled: state.cancelled,
            aborted: state.aborted,
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Propagate skips and start ready tasks. Returns true if any task reached
    /// a terminal state without being dispatched, which may unblock or block
    /// others and calls for another pass.
    async fn advance<K: TaskResultSink>(
        &self,
        state: &mut RunState,
        sink: &K,
        workers: &mut JoinSet<WorkerOutcome>,
        progress: &mpsc::UnboundedSender<RetryProgress>,
    ) -> bool {
        let mut changed = self.propagate_skips(state, sink).await;

        let mut ready: Vec<usize> = (0..self.workflow.tasks.len())
            .filter(|&idx| {
                matches!(state.results[idx].status, TaskStatus::Pending | TaskStatus::Ready)
                    && self
                        .graph
                        .dependencies(idx)
                        .iter()
                        .all(|&dep| state.results[dep].status == TaskStatus::Succeeded)
                    && self.fallback_triggered(state, idx)
            })
            .collect();

        for &idx in &ready {
            if state.results[idx].status == TaskStatus::Pending {
                state.results[idx].mark_ready();
                self.record(state, sink, idx).await;
            }
        }

        // Stable sort: ties keep definition order.
        ready.sort_by_key(|&idx| Reverse(self.workflow.tasks[idx].priority));

        for idx in ready {
            if state.running >= self.max_concurrency || state.aborted.is_some() {
                break;
            }
            changed |= self.start_task(state, sink, workers, progress, idx).await;
        }
        changed
    }

    /// A fallback handler may start only after a task it covers failed and
    /// every task it covers has settled. Other tasks are never held back.
    fn fallback_triggered(&self, state: &RunState, idx: usize) -> bool {
        let sources = self.graph.fallback_sources(idx);
        sources.is_empty()
            || (sources.iter().all(|&s| state.results[s].status.is_terminal())
                && sources
                    .iter()
                    .any(|&s| state.results[s].status == TaskStatus::Failed))
    }

    async fn propagate_skips<K: TaskResultSink>(&self, state: &mut RunState, sink: &K) -> bool {
        let eager = self.workflow.on_error == OnErrorPolicy::Stop;
        let mut changed = false;
        for &idx in self.graph.topological_order() {
            if state.results[idx].status != TaskStatus::Pending {
                continue;
            }
            let sources = self.graph.fallback_sources(idx);
            if !sources.is_empty()
                && sources.iter().all(|&s| {
                    let status = state.results[s].status;
                    status.is_terminal() && status != TaskStatus::Failed
                })
            {
                self.skip(state, sink, idx, "no failure to handle".to_string())
                    .await;
                changed = true;
                continue;
            }
            let deps = self.graph.dependencies(idx);
            let Some(&blocker) = deps.iter().find(|&&dep| {
                matches!(
                    state.results[dep].status,
                    TaskStatus::Failed | TaskStatus::Skipped
                )
            }) else {
                continue;
            };
            if eager || deps.iter().all(|&dep| state.results[dep].status.is_terminal()) {
                let reason = format!(
                    "dependency '{}' {}",
                    self.graph.task_id(blocker),
                    state.results[blocker].status
                );
                self.skip(state, sink, idx, reason).await;
                changed = true;
            }
        }
        changed
    }

    /// Evaluate the condition, resolve parameters and spawn the worker.
    /// Returns true if the task finished without being dispatched.
    async fn start_task<K: TaskResultSink>(
        &self,
        state: &mut RunState,
        sink: &K,
        workers: &mut JoinSet<WorkerOutcome>,
        progress: &mpsc::UnboundedSender<RetryProgress>,
        idx: usize,
    ) -> bool {
        let task = &self.workflow.tasks[idx];
        let context =
            ResolutionContext::new(state.variables.clone()).with_task_results(state.results.iter());

        if let Some(condition) = &task.condition {
            match self
                .evaluator
                .evaluate_bool(condition, &context.to_expression_context())
            {
                Ok(true) => {}
                Ok(false) => {
                    self.skip(state, sink, idx, "condition evaluated to false".to_string())
                        .await;
                    return true;
                }
                Err(e) => {
                    self.fail(state, sink, idx, InvocationError::Unresolved(e), 0).await;
                    return true;
                }
            }
        }

        let job = match &task.for_each {
            None => match context.resolve_map(&task.parameters) {
                Ok(parameters) => Job::Single {
                    parameters: Value::Object(parameters),
                },
                Err(e) => {
                    self.fail(state, sink, idx, InvocationError::Unresolved(e), 0).await;
                    return true;
                }
            },
            Some(spec) => match context.resolve(&spec.items) {
                Ok(Value::Array(items)) => {
                    // Elements share the pool budget with every other task.
                    let available = self.max_concurrency.saturating_sub(state.running).max(1);
                    let width = spec.concurrency.max(1).min(items.len().max(1)).min(available);
                    Job::FanOut {
                        items,
                        context,
                        spec: spec.clone(),
                        width,
                    }
                }
                Ok(other) => {
                    let error = ExpressionError::InvalidContext(format!(
                        "for_each.items must resolve to an array, got {}",
                        json_type(&other)
                    ));
                    self.fail(state, sink, idx, InvocationError::Unresolved(error), 0)
                        .await;
                    return true;
                }
                Err(e) => {
                    self.fail(state, sink, idx, InvocationError::Unresolved(e), 0).await;
                    return true;
                }
            },
        };

        let slots = match &job {
            Job::Single { .. } => 1,
            Job::FanOut { width, .. } => *width,
        };
        state.results[idx].mark_running();
        state.started[idx] = Some(Instant::now());
        state.slots[idx] = slots;
        state.running += slots;
        self.record(state, sink, idx).await;

        tracing::debug!(
            execution_id = %self.execution_id,
            task_id = %task.id,
            capability = %task.capability_key(),
            "task started"
        );
        self.events.publish(EngineEvent::TaskStarted {
            execution_id: self.execution_id,
            task_id: task.id.clone(),
            capability: task.capability_key(),
        });

        let workflow = Arc::clone(&self.workflow);
        let invoker = Arc::clone(&self.invoker);
        let cancel = self.cancel.clone();
        let progress = progress.clone();
        let handle = workers.spawn(async move {
            let task = &workflow.tasks[idx];
            let on_retry = move |notice: RetryNotice| {
                let _ = progress.send(RetryProgress { index: idx, notice });
            };
            let (result, attempts) = run_job(&invoker, task, job, &cancel, &on_retry).await;
            WorkerOutcome {
                index: idx,
                result,
                attempts,
            }
        });
        state.workers.insert(handle.id(), idx);
        false
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn publish_progress(&self, state: &RunState) {
        if let Some(progress) = &self.progress {
            progress.send_replace(TaskCounts::tally(&state.results, state.running));
        }
    }

    fn release(&self, state: &mut RunState, idx: usize) {
        let slots = std::mem::take(&mut state.slots[idx]);
        state.running = state.running.saturating_sub(slots);
    }

    async fn on_complete<K: TaskResultSink>(&self, state: &mut RunState, sink: &K, outcome: WorkerOutcome) {
        let idx = outcome.index;
        self.release(state, idx);
        let output = match outcome.result {
            Ok(output) => output,
            Err(error) => {
                self.fail(state, sink, idx, error, outcome.attempts).await;
                return;
            }
        };

        let task = &self.workflow.tasks[idx];
        let duration_ms = state.started[idx]
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        if let Some(variable) = &task.export {
            state.variables.insert(variable.clone(), output.clone());
        }
        state.results[idx].attempt_count = outcome.attempts;
        state.results[idx].mark_succeeded(output);
        state.steps_completed += 1;

        tracing::debug!(
            execution_id = %self.execution_id,
            task_id = %task.id,
            attempts = outcome.attempts,
            duration_ms,
            "task succeeded"
        );
        self.events.publish(EngineEvent::TaskSucceeded {
            execution_id: self.execution_id,
            task_id: task.id.clone(),
            attempts: outcome.attempts,
            duration_ms,
        });

        self.record(state, sink, idx).await;
        if state.aborted.is_none() {
            if let Err(e) = sink.checkpoint(state.steps_completed, &state.variables).await {
                self.abort(state, e);
            }
        }
    }

    /// A worker that panicked or was aborted never reports its outcome; fail
    /// its task so nothing is left running.
    async fn on_worker_lost<K: TaskResultSink>(&self, state: &mut RunState, sink: &K, error: JoinError) {
        let Some(idx) = state.workers.remove(&error.id()) else {
            tracing::error!(execution_id = %self.execution_id, error = %error, "unknown worker failed");
            return;
        };
        self.release(state, idx);
        let message = if error.is_panic() {
            "capability panicked"
        } else {
            "worker was cancelled"
        };
        tracing::error!(
            execution_id = %self.execution_id,
            task_id = %self.workflow.tasks[idx].id,
            error = %error,
            "worker lost"
        );
        let attempts = state.results[idx].attempt_count.max(1);
        let error = InvocationError::Capability(CapabilityError::internal(message));
        self.fail(state, sink, idx, error, attempts).await;
    }

    async fn on_retry<K: TaskResultSink>(&self, state: &mut RunState, sink: &K, progress: RetryProgress) {
        let idx = progress.index;
        if state.results[idx].status != TaskStatus::Running {
            return;
        }
        let notice = progress.notice;
        state.results[idx].attempt_count = state.results[idx].attempt_count.max(notice.attempt);
        self.events.publish(EngineEvent::TaskRetrying {
            execution_id: self.execution_id,
            task_id: self.workflow.tasks[idx].id.clone(),
            attempt: notice.attempt,
            delay_ms: notice.delay.as_millis() as u64,
            error: notice.error,
        });
        self.record(state, sink, idx).await;
    }

    async fn fail<K: TaskResultSink>(
        &self,
        state: &mut RunState,
        sink: &K,
        idx: usize,
        error: InvocationError,
        attempts: u32,
    ) {
        let task_id = self.workflow.tasks[idx].id.clone();
        let message = error.to_string();
        state.results[idx].attempt_count = attempts;
        state.results[idx].mark_failed(message.clone(), Some(error.category()));
        if error != InvocationError::Cancelled {
            state
                .failures
                .push((idx, format!("task '{task_id}' failed: {message}")));
        }

        tracing::warn!(
            execution_id = %self.execution_id,
            task_id = %task_id,
            attempts,
            error = %message,
            "task failed"
        );
        self.events.publish(EngineEvent::TaskFailed {
            execution_id: self.execution_id,
            task_id,
            attempts,
            error: message,
        });
        self.record(state, sink, idx).await;
    }

    async fn skip<K: TaskResultSink>(&self, state: &mut RunState, sink: &K, idx: usize, reason: String) {
        let task_id = self.workflow.tasks[idx].id.clone();
        state.results[idx].mark_skipped(Some(reason.clone()));
        tracing::debug!(execution_id = %self.execution_id, task_id = %task_id, reason = %reason, "task skipped");
        self.events.publish(EngineEvent::TaskSkipped {
            execution_id: self.execution_id,
            task_id,
            reason,
        });
        self.record(state, sink, idx).await;
    }

    async fn skip_unstarted<K: TaskResultSink>(&self, state: &mut RunState, sink: &K, reason: &str) {
        for idx in 0..state.results.len() {
            if state.aborted.is_some() {
                return;
            }
            if matches!(state.results[idx].status, TaskStatus::Pending | TaskStatus::Ready) {
                self.skip(state, sink, idx, reason.to_string()).await;
            }
        }
    }

    async fn record<K: TaskResultSink>(&self, state: &mut RunState, sink: &K, idx: usize) {
        if state.aborted.is_some() {
            return;
        }
        if let Err(e) = sink.record(&state.results[idx]).await {
            self.abort(state, e);
        }
    }

    fn abort(&self, state: &mut RunState, error: StateError) {
        tracing::error!(
            execution_id = %self.execution_id,
            error = %error,
            "persisting execution state failed, abandoning execution"
        );
        state.aborted = Some(error);
    }
}

// ---------------------------------------------------------------------------
// Worker body
// ---------------------------------------------------------------------------

async fn run_job(
    invoker: &TaskInvoker,
    task: &TaskSpec,
    job: Job,
    cancel: &CancellationToken,
    on_retry: &(dyn Fn(RetryNotice) + Send + Sync),
) -> (Result<Value, InvocationError>, u32) {
    match job {
        Job::Single { parameters } => {
            let invocation = invoker.invoke(task, &parameters, cancel, on_retry).await;
            (invocation.result, invocation.attempts)
        }
        Job::FanOut {
            items,
            context,
            spec,
            width,
        } => {
            let total = items.len();
            let max_attempts = AtomicU32::new(0);
            let outcome = FanOut::run(items, width, spec.fail_fast, |index, item| {
                let context = &context;
                let max_attempts = &max_attempts;
                async move {
                    let parameters = context
                        .with_item(item, index)
                        .resolve_map(&task.parameters)
                        .map_err(InvocationError::Unresolved)?;
                    let invocation = invoker
                        .invoke(task, &Value::Object(parameters), cancel, on_retry)
                        .await;
                    max_attempts.fetch_max(invocation.attempts, Ordering::Relaxed);
                    invocation.result
                }
            })
            .await;

            let attempts = max_attempts.load(Ordering::Relaxed);
            if cancel.is_cancelled() && outcome.failed > 0 {
                return (Err(InvocationError::Cancelled), attempts);
            }
            if outcome.is_failure(spec.fail_fast) {
                let message = format!(
                    "{} of {} elements failed: {}",
                    outcome.failed,
                    total,
                    outcome.first_error().unwrap_or("unknown error")
                );
                let error = CapabilityError::new(ErrorCategory::Other("fan_out".to_string()), message);
                return (Err(InvocationError::Capability(error)), attempts);
            }
            (Ok(outcome.to_output(spec.aggregate)), attempts)
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
