//! Orchestration engine: submission, execution lifecycle, and chaining.
//!
//! `OrchestrationEngine` accepts a workflow and a trigger, validates the
//! dependency graph synchronously, persists the execution with one pending
//! result per task, and hands it to a coordinator task that drives a
//! `TaskPool` to completion. Every state transition goes through the
//! `StateManager`.
//!
//! # Execution flow
//!
//! 1. `submit` validates the definition. Structural errors are returned
//!    before anything is persisted.
//! 2. The execution and its task results are created atomically.
//! 3. The coordinator marks the execution `running`, runs the pool, and
//!    writes the terminal status, `steps_completed`, and final variables.
//! 4. Chain rules of the finished workflow are planned and the downstream
//!    executions submitted with `trigger_type = chained`.
//!
//! The engine is cheap to clone; clones share all state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use semver::VersionReq;
use serde::Serialize;
use serde_json::Value;
use taskweave_types::config::EngineConfig;
use taskweave_types::event::EngineEvent;
use taskweave_types::execution::{
    Execution, ExecutionPatch, ExecutionStatus, TaskResult, Trigger,
};
use taskweave_types::workflow::{ChainRule, Workflow};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::execution::ExecutionStore;

use super::capability::CapabilityRegistry;
use super::catalog::{CatalogError, WorkflowCatalog};
use super::chain::ChainRegistry;
use super::circuit::CircuitBreakerRegistry;
use super::dag::{DependencyGraph, GraphError};
use super::definition::{validate_workflow, DefinitionError};
use super::expression::ConditionEvaluator;
use super::pool::{CANCELLED_REASON, TaskCounts, TaskPool, TaskResultSink};
use super::retry::TaskInvoker;
use super::state::{StateError, StateManager};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Cyclic or unknown dependency. Nothing was persisted.
    #[error("invalid workflow graph: {0}")]
    Structural(#[from] GraphError),

    #[error("invalid workflow definition: {0}")]
    Definition(DefinitionError),

    /// Unknown workflow id, no matching version, or a version conflict.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("chain depth {depth} exceeds the maximum of {max}")]
    ChainDepthExceeded { depth: u32, max: u32 },

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution {0} has already finished")]
    AlreadyTerminal(Uuid),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl From<DefinitionError> for EngineError {
    fn from(e: DefinitionError) -> Self {
        match e {
            DefinitionError::Graph(graph) => EngineError::Structural(graph),
            other => EngineError::Definition(other),
        }
    }
}

fn state_err(e: StateError) -> EngineError {
    match e {
        StateError::NotFound(id) => EngineError::NotFound(id),
        StateError::AlreadyTerminal { execution_id, .. } => EngineError::AlreadyTerminal(execution_id),
        other => EngineError::State(other),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures an `OrchestrationEngine`.
pub struct EngineBuilder<S: ExecutionStore> {
    store: S,
    config: EngineConfig,
    capabilities: CapabilityRegistry,
    circuits: Option<Arc<CircuitBreakerRegistry>>,
    events: Option<EventBus>,
}

impl<S: ExecutionStore + 'static> EngineBuilder<S> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Use `circuits` instead of the process-wide registry.
    pub fn circuit_registry(mut self, circuits: Arc<CircuitBreakerRegistry>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> OrchestrationEngine<S> {
        let config = self.config;
        let circuits = self
            .circuits
            .unwrap_or_else(|| CircuitBreakerRegistry::global_with(config.circuit_breaker.clone()));
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.event_capacity));
        let evaluator = Arc::new(ConditionEvaluator::new());
        let invoker = TaskInvoker::new(Arc::new(self.capabilities), circuits)
            .with_default_retry(config.default_retry.clone())
            .with_default_timeout(config.task_timeout_ms.map(Duration::from_millis));

        OrchestrationEngine {
            inner: Arc::new(EngineInner {
                state: StateManager::new(self.store),
                invoker: Arc::new(invoker),
                chains: ChainRegistry::with_evaluator(Arc::clone(&evaluator)),
                evaluator,
                catalog: WorkflowCatalog::new(),
                events,
                running: DashMap::new(),
                finished: FinishedCounters::default(),
                shutdown: CancellationToken::new(),
                config,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestrationEngine
// ---------------------------------------------------------------------------

/// Handle to an execution owned by a coordinator in this process.
struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<Option<Execution>>,
    progress: watch::Receiver<TaskCounts>,
}

/// Executions this engine drove to a terminal status.
#[derive(Default)]
struct FinishedCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl FinishedCounters {
    fn count(&self, status: ExecutionStatus) {
        let counter = match status {
            ExecutionStatus::Completed => &self.completed,
            ExecutionStatus::Failed => &self.failed,
            ExecutionStatus::Cancelled => &self.cancelled,
            ExecutionStatus::Pending | ExecutionStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time load of an engine.
///
/// Task figures cover executions currently running in this process;
/// execution totals cover everything this engine finished since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub running_executions: usize,
    /// Tasks waiting on dependencies or a free slot.
    pub queued_tasks: usize,
    pub running_tasks: usize,
    /// Concurrency slots in use, summed over running executions.
    pub slots_in_use: usize,
    /// Slot limit of each execution.
    pub max_concurrency: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct EngineInner<S: ExecutionStore> {
    config: EngineConfig,
    state: StateManager<S>,
    invoker: Arc<TaskInvoker>,
    evaluator: Arc<ConditionEvaluator>,
    catalog: WorkflowCatalog,
    chains: ChainRegistry,
    events: EventBus,
    running: DashMap<Uuid, RunHandle>,
    finished: FinishedCounters,
    shutdown: CancellationToken,
}

/// Top-level workflow orchestrator.
///
/// Generic over `S: ExecutionStore` for storage flexibility.
pub struct OrchestrationEngine<S: ExecutionStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: ExecutionStore> Clone for OrchestrationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ExecutionStore + 'static> OrchestrationEngine<S> {
    pub fn builder(store: S) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            config: EngineConfig::default(),
            capabilities: CapabilityRegistry::new(),
            circuits: None,
            events: None,
        }
    }

    pub fn new(store: S, capabilities: CapabilityRegistry) -> Self {
        Self::builder(store).capabilities(capabilities).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &StateManager<S> {
        &self.inner.state
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.inner.catalog
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        self.inner.invoker.circuits()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Definitions and chain rules
    // -----------------------------------------------------------------------

    /// Validate and register a workflow version so chain rules and
    /// `submit_registered` can find it.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<Arc<Workflow>, EngineError> {
        validate_workflow(&workflow)?;
        let workflow = self.inner.catalog.register(workflow)?;
        self.inner.state.save_workflow(&workflow).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            version = %workflow.version,
            tasks = workflow.tasks.len(),
            "workflow registered"
        );
        Ok(workflow)
    }

    /// Start `rule.target` whenever an execution of `source` finishes.
    pub async fn register_chain(&self, source: impl Into<String>, rule: ChainRule) {
        self.inner.chains.register(source, rule).await;
    }

    pub async fn unregister_chains(&self, source: &str) -> usize {
        self.inner.chains.unregister(source).await
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Start an execution of `workflow`. Returns once the execution is
    /// persisted; tasks run in the background.
    ///
    /// The definition is registered in the catalog as a side effect.
    pub async fn submit(&self, workflow: &Workflow, trigger: Trigger) -> Result<Uuid, EngineError> {
        validate_workflow(workflow)?;
        let workflow = self.inner.catalog.register(workflow.clone())?;
        self.inner.start(workflow, trigger).await
    }

    /// Start the highest registered version of `workflow_id` matching
    /// `version` (or the latest when `None`).
    pub async fn submit_registered(
        &self,
        workflow_id: &str,
        version: Option<&VersionReq>,
        trigger: Trigger,
    ) -> Result<Uuid, EngineError> {
        let workflow = self.inner.catalog.resolve(workflow_id, version)?;
        self.inner.start(workflow, trigger).await
    }

    /// Submit and wait for the terminal execution.
    pub async fn run(&self, workflow: &Workflow, trigger: Trigger) -> Result<Execution, EngineError> {
        let execution_id = self.submit(workflow, trigger).await?;
        self.wait(execution_id).await
    }

    /// Wait until `execution_id` is terminal and return it.
    ///
    /// For executions not owned by this process, returns the stored record
    /// as is.
    pub async fn wait(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let receiver = self
            .inner
            .running
            .get(&execution_id)
            .map(|handle| handle.done.clone());
        if let Some(mut receiver) = receiver {
            let finished = {
                let done = receiver.wait_for(|done| done.is_some()).await;
                done.ok().and_then(|done| (*done).clone())
            };
            if let Some(execution) = finished {
                return Ok(execution);
            }
        }
        self.get_execution(execution_id).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.inner
            .state
            .get(execution_id)
            .await?
            .ok_or(EngineError::NotFound(execution_id))
    }

    /// Task results in workflow definition order.
    pub async fn get_execution_tasks(&self, execution_id: Uuid) -> Result<Vec<TaskResult>, EngineError> {
        self.inner.state.tasks(execution_id).await.map_err(state_err)
    }

    /// Ids of `pending` and `running` executions, oldest first.
    pub async fn list_active_executions(&self) -> Result<Vec<Uuid>, EngineError> {
        Ok(self
            .inner
            .state
            .list_active()
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Cancel an execution.
    ///
    /// Executions owned by this process stop at their next suspension point:
    /// unstarted tasks are skipped and in-flight invocations are left to
    /// finish. Anything else still active in the store is settled directly.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let token = self
            .inner
            .running
            .get(&execution_id)
            .map(|handle| handle.cancel.clone());
        if let Some(token) = token {
            // The coordinator persists the terminal status before it lets go
            // of the handle.
            if self.get_execution(execution_id).await?.status.is_terminal() {
                return Err(EngineError::AlreadyTerminal(execution_id));
            }
            token.cancel();
            tracing::info!(execution_id = %execution_id, "execution cancellation requested");
            return Ok(());
        }

        let cancelled = self
            .inner
            .state
            .cancel(execution_id, CANCELLED_REASON)
            .await
            .map_err(state_err)?;
        self.inner.publish_finished(&cancelled);
        tracing::info!(execution_id = %execution_id, "cancelled orphaned execution");
        Ok(())
    }

    /// Reap executions with no progress for `stale_timeout_ms`.
    pub async fn cleanup_stale(&self) -> Result<Vec<Uuid>, EngineError> {
        self.inner.cleanup_stale().await
    }

    /// Run `cleanup_stale` every `cleanup_interval_ms` until shutdown.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = inner.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.cleanup_stale().await {
                            tracing::error!(error = %e, "stale execution sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("stale execution reaper stopped");
        })
    }

    /// Fail every execution left active by a previous process.
    ///
    /// Call once at startup, before submitting anything.
    pub async fn recover(&self) -> Result<Vec<Uuid>, EngineError> {
        let recovered = self.inner.state.recover().await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "failed executions interrupted by a previous shutdown");
        }
        Ok(recovered)
    }

    /// Stop accepting work, cancel every running execution, and stop the reaper.
    pub fn shutdown(&self) {
        tracing::info!(running = self.inner.running.len(), "engine shutting down");
        self.inner.shutdown.cancel();
    }

    /// Executions currently driven by this process.
    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// Snapshot of running work and finished totals.
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            max_concurrency: self.inner.config.max_concurrency,
            completed: self.inner.finished.completed.load(Ordering::Relaxed),
            failed: self.inner.finished.failed.load(Ordering::Relaxed),
            cancelled: self.inner.finished.cancelled.load(Ordering::Relaxed),
            ..EngineStats::default()
        };
        for handle in self.inner.running.iter() {
            let counts = *handle.progress.borrow();
            stats.running_executions += 1;
            stats.queued_tasks += counts.queued;
            stats.running_tasks += counts.running;
            stats.slots_in_use += counts.slots_in_use;
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Persists pool transitions through the state manager.
struct StateSink<'a, S: ExecutionStore> {
    state: &'a StateManager<S>,
    execution_id: Uuid,
}

impl<S: ExecutionStore> TaskResultSink for StateSink<'_, S> {
    async fn record(&self, result: &TaskResult) -> Result<(), StateError> {
        self.state.record_task(self.execution_id, result).await
    }

    async fn checkpoint(
        &self,
        steps_completed: u32,
        variables: &HashMap<String, Value>,
    ) -> Result<(), StateError> {
        let patch = ExecutionPatch::default()
            .with_steps_completed(steps_completed)
            .with_variables(variables.clone());
        self.state.update(self.execution_id, &patch).await.map(|_| ())
    }
}

type BoxedRun = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Channels the coordinator of one execution reports through.
struct Run {
    cancel: CancellationToken,
    done: watch::Sender<Option<Execution>>,
    progress: watch::Sender<TaskCounts>,
}

impl<S: ExecutionStore + 'static> EngineInner<S> {
    async fn start(self: &Arc<Self>, workflow: Arc<Workflow>, trigger: Trigger) -> Result<Uuid, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        if trigger.chain_depth > self.config.max_chain_depth {
            return Err(EngineError::ChainDepthExceeded {
                depth: trigger.chain_depth,
                max: self.config.max_chain_depth,
            });
        }

        let graph = Arc::new(DependencyGraph::build(&workflow)?);
        self.state.save_workflow(&workflow).await?;

        let execution = Execution::new(
            workflow.id.clone(),
            workflow.version.clone(),
            &workflow.variables,
            workflow.tasks.len() as u32,
            &trigger,
        );
        let tasks: Vec<TaskResult> = workflow
            .tasks
            .iter()
            .map(|t| TaskResult::pending(t.id.clone()))
            .collect();
        self.state.create(&execution, &tasks).await?;

        let execution_id = execution.id;
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(None);
        let (progress_tx, progress_rx) = watch::channel(TaskCounts {
            queued: tasks.len(),
            ..TaskCounts::default()
        });
        self.running.insert(
            execution_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
                progress: progress_rx,
            },
        );

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            version = %workflow.version,
            trigger_type = %trigger.trigger_type,
            chain_depth = trigger.chain_depth,
            "execution submitted"
        );

        let run = Run {
            cancel,
            done: done_tx,
            progress: progress_tx,
        };
        self.spawn_coordinator(execution, workflow, graph, run);
        Ok(execution_id)
    }

    /// Boxed so chained submissions from inside `drive` do not make its
    /// future type recursive.
    fn spawn_coordinator(
        self: &Arc<Self>,
        execution: Execution,
        workflow: Arc<Workflow>,
        graph: Arc<DependencyGraph>,
        run: Run,
    ) {
        let inner = Arc::clone(self);
        let coordinator: BoxedRun = Box::pin(async move {
            inner.drive(execution, workflow, graph, run).await;
        });
        tokio::spawn(coordinator);
    }

    async fn drive(
        self: Arc<Self>,
        execution: Execution,
        workflow: Arc<Workflow>,
        graph: Arc<DependencyGraph>,
        run: Run,
    ) {
        let execution_id = execution.id;
        let Run {
            cancel,
            done,
            progress,
        } = run;
        let finished = self
            .execute(execution, Arc::clone(&workflow), graph, cancel, progress)
            .await;

        if let Some((finished, results)) = &finished {
            self.finished.count(finished.status);
            self.publish_finished(finished);
            self.fire_chains(&workflow, finished, results).await;
        }

        // Waiters holding the handle wake only after chains are planned.
        self.running.remove(&execution_id);
        done.send_replace(finished.map(|(execution, _)| execution));
    }

    /// Run the pool and persist the outcome. Returns the terminal execution
    /// as stored, with the task results the chain planner should see.
    async fn execute(
        &self,
        execution: Execution,
        workflow: Arc<Workflow>,
        graph: Arc<DependencyGraph>,
        cancel: CancellationToken,
        progress: watch::Sender<TaskCounts>,
    ) -> Option<(Execution, Vec<TaskResult>)> {
        let execution_id = execution.id;

        if let Err(e) = self
            .state
            .update(execution_id, &ExecutionPatch::status(ExecutionStatus::Running))
            .await
        {
            tracing::error!(execution_id = %execution_id, error = %e, "failed to start execution");
            return self.reload(execution_id).await;
        }

        self.events.publish(EngineEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version.to_string(),
            trigger_type: execution.trigger_type.to_string(),
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            total_steps = execution.total_steps,
            "execution started"
        );

        let sink = StateSink {
            state: &self.state,
            execution_id,
        };
        let outcome = TaskPool::new(Arc::clone(&workflow), graph, Arc::clone(&self.invoker), execution_id)
            .with_max_concurrency(self.config.max_concurrency)
            .with_events(self.events.clone())
            .with_evaluator(Arc::clone(&self.evaluator))
            .with_cancel(cancel)
            .with_progress(progress)
            .run(execution.variables.clone(), &sink)
            .await;

        let status = outcome.status();
        let patch = ExecutionPatch::finished(status, outcome.error_message())
            .with_steps_completed(outcome.steps_completed)
            .with_variables(outcome.variables.clone());

        match self.state.update(execution_id, &patch).await {
            Ok(finished) => {
                tracing::info!(
                    execution_id = %execution_id,
                    workflow_id = %finished.workflow_id,
                    status = %finished.status,
                    steps_completed = finished.steps_completed,
                    total_steps = finished.total_steps,
                    "execution finished"
                );
                Some((finished, outcome.results))
            }
            Err(StateError::AlreadyTerminal { status, .. }) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    status = %status,
                    "execution was settled elsewhere before the coordinator finished"
                );
                self.reload(execution_id).await
            }
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "failed to persist final execution state");
                self.reload(execution_id).await
            }
        }
    }

    async fn reload(&self, execution_id: Uuid) -> Option<(Execution, Vec<TaskResult>)> {
        let execution = match self.state.get(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "failed to reload execution");
                return None;
            }
        };
        let results = self.state.tasks(execution_id).await.unwrap_or_default();
        Some((execution, results))
    }

    fn publish_finished(&self, execution: &Execution) {
        self.events.publish(EngineEvent::ExecutionFinished {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            steps_completed: execution.steps_completed,
            error: execution.error_message.clone(),
        });
    }

    async fn fire_chains(self: &Arc<Self>, workflow: &Workflow, finished: &Execution, results: &[TaskResult]) {
        if !finished.status.is_terminal() {
            return;
        }
        let planned = self
            .chains
            .plan(finished, results, &workflow.chains, self.config.max_chain_depth)
            .await;

        for chain in planned {
            let target = match self.catalog.resolve(&chain.target, chain.version.as_ref()) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %finished.id,
                        target = %chain.target,
                        error = %e,
                        "chain target not available"
                    );
                    continue;
                }
            };
            let chain_depth = chain.trigger.chain_depth;
            match self.start(Arc::clone(&target), chain.trigger).await {
                Ok(child_id) => {
                    tracing::info!(
                        parent_execution_id = %finished.id,
                        execution_id = %child_id,
                        workflow_id = %target.id,
                        chain_depth,
                        "chained execution started"
                    );
                    self.events.publish(EngineEvent::ChainTriggered {
                        parent_execution_id: finished.id,
                        execution_id: child_id,
                        workflow_id: target.id.clone(),
                        chain_depth,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %finished.id,
                        target = %chain.target,
                        error = %e,
                        "failed to start chained execution"
                    );
                }
            }
        }
    }

    async fn cleanup_stale(&self) -> Result<Vec<Uuid>, EngineError> {
        let reclaimed = self.state.cleanup_stale(self.config.stale_timeout()).await?;
        for execution_id in &reclaimed {
            // A coordinator here may still be waiting on a hung invocation.
            if let Some(handle) = self.running.get(execution_id) {
                handle.cancel.cancel();
            }
        }
        Ok(reclaimed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
