//! Cross-workflow chaining.
//!
//! When an execution finishes, the rules registered for its workflow (plus
//! the rules declared inline in the definition) decide which workflows start
//! next. Each rule fires on a set of terminal statuses, may carry a JEXL
//! guard, and maps variables from the finished execution into the new one.
//!
//! Workflow ids are opaque, so chain cycles cannot be detected up front.
//! Every chained trigger carries `chain_depth`; anything past the configured
//! maximum is dropped with a warning.

use std::collections::HashMap;
use std::sync::Arc;

use semver::VersionReq;
use serde_json::{json, Value};
use taskweave_types::execution::{Execution, TaskResult, Trigger};
use taskweave_types::workflow::ChainRule;
use tokio::sync::RwLock;

use super::expression::{ConditionEvaluator, ExpressionError};
use super::resolver::ResolutionContext;

/// A downstream execution to start.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChain {
    pub target: String,
    pub version: Option<VersionReq>,
    pub trigger: Trigger,
}

/// Chain rules keyed by source workflow id.
pub struct ChainRegistry {
    rules: Arc<RwLock<HashMap<String, Vec<ChainRule>>>>,
    evaluator: Arc<ConditionEvaluator>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(ConditionEvaluator::new()))
    }

    pub fn with_evaluator(evaluator: Arc<ConditionEvaluator>) -> Self {
        Self {
            rules: Arc::new(RwLock::new(HashMap::new())),
            evaluator,
        }
    }

    /// Start `rule.target` whenever an execution of `source` finishes.
    pub async fn register(&self, source: impl Into<String>, rule: ChainRule) {
        let source = source.into();
        tracing::info!(source = %source, target = %rule.target, "registered chain rule");
        self.rules.write().await.entry(source).or_default().push(rule);
    }

    /// Remove every registered rule for `source`. Returns how many were removed.
    pub async fn unregister(&self, source: &str) -> usize {
        self.rules
            .write()
            .await
            .remove(source)
            .map(|rules| rules.len())
            .unwrap_or(0)
    }

    pub async fn rules_for(&self, source: &str) -> Vec<ChainRule> {
        self.rules
            .read()
            .await
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// Decide which executions `finished` should start.
    ///
    /// `inline` holds rules declared on the finished workflow's definition;
    /// they are considered before registered ones. Rules whose guard or
    /// variable mapping cannot be evaluated are skipped with a warning.
    pub async fn plan(
        &self,
        finished: &Execution,
        tasks: &[TaskResult],
        inline: &[ChainRule],
        max_depth: u32,
    ) -> Vec<PlannedChain> {
        let registered = self.rules_for(&finished.workflow_id).await;
        let rules: Vec<&ChainRule> = inline
            .iter()
            .chain(registered.iter())
            .filter(|rule| rule.fires_on(finished.status))
            .collect();
        if rules.is_empty() {
            return Vec::new();
        }

        let depth = finished.chain_depth + 1;
        if depth > max_depth {
            tracing::warn!(
                execution_id = %finished.id,
                workflow_id = %finished.workflow_id,
                chain_depth = depth,
                max_chain_depth = max_depth,
                "chain depth exceeded, not triggering downstream workflows"
            );
            return Vec::new();
        }

        let resolver = ResolutionContext::new(finished.variables.clone()).with_task_results(tasks.iter());
        let guard_context = guard_context(finished, &resolver);

        let mut planned = Vec::new();
        for rule in rules {
            match self.plan_rule(rule, finished, &resolver, &guard_context) {
                Ok(Some(chain)) => planned.push(chain),
                Ok(None) => {
                    tracing::debug!(
                        execution_id = %finished.id,
                        target = %rule.target,
                        "chain condition false"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %finished.id,
                        target = %rule.target,
                        error = %e,
                        "chain rule skipped"
                    );
                }
            }
        }
        planned
    }

    fn plan_rule(
        &self,
        rule: &ChainRule,
        finished: &Execution,
        resolver: &ResolutionContext,
        guard_context: &Value,
    ) -> Result<Option<PlannedChain>, ExpressionError> {
        if let Some(condition) = &rule.condition {
            if !self.evaluator.evaluate_bool(condition, guard_context)? {
                return Ok(None);
            }
        }

        let mut variables = HashMap::with_capacity(rule.variables.len());
        for (name, value) in &rule.variables {
            variables.insert(name.clone(), resolver.resolve(value)?);
        }

        Ok(Some(PlannedChain {
            target: rule.target.clone(),
            version: rule.version.clone(),
            trigger: Trigger::chained(finished).with_variables(variables),
        }))
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRegistry").finish_non_exhaustive()
    }
}

/// `{ execution: {...}, workflow, variables, tasks }` for chain guards.
fn guard_context(finished: &Execution, resolver: &ResolutionContext) -> Value {
    let mut context = resolver.to_expression_context();
    if let Some(obj) = context.as_object_mut() {
        obj.insert(
            "execution".to_string(),
            json!({
                "id": finished.id.to_string(),
                "workflow_id": finished.workflow_id,
                "version": finished.workflow_version.to_string(),
                "status": finished.status.as_str(),
                "error": finished.error_message,
                "steps_completed": finished.steps_completed,
                "total_steps": finished.total_steps,
                "chain_depth": finished.chain_depth,
            }),
        );
        obj.insert("variables".to_string(), json!(finished.variables));
    }
    context
}

#[cfg(test)]
mod tests {
    use semver::Version;
    use taskweave_types::execution::{ExecutionStatus, TriggerType};

    use super::*;

    fn finished(status: ExecutionStatus, depth: u32) -> Execution {
        let mut trigger = Trigger::manual("test");
        trigger.chain_depth = depth;
        let mut exec = Execution::new(
            "ingest",
            Version::new(1, 0, 0),
            &HashMap::from([("region".to_string(), json!("eu"))]),
            1,
            &trigger,
        );
        exec.status = status;
        exec
    }

    fn fetched() -> Vec<TaskResult> {
        let mut r = TaskResult::pending("fetch");
        r.mark_running();
        r.mark_succeeded(json!({ "rows": 12 }));
        vec![r]
    }

    #[tokio::test]
    async fn test_fires_on_matching_status_with_mapped_variables() {
        let chains = ChainRegistry::new();
        chains
            .register(
                "ingest",
                ChainRule::on_completed("report")
                    .with_variable("rows", json!("{{ tasks.fetch.output.rows }}"))
                    .with_variable("label", json!("{{ workflow.region }}-daily")),
            )
            .await;
        chains
            .register(
                "ingest",
                ChainRule::on_completed("alert").on(vec![ExecutionStatus::Failed]),
            )
            .await;

        let parent = finished(ExecutionStatus::Completed, 0);
        let planned = chains.plan(&parent, &fetched(), &[], 5).await;

        assert_eq!(planned.len(), 1);
        let chain = &planned[0];
        assert_eq!(chain.target, "report");
        assert_eq!(chain.trigger.trigger_type, TriggerType::Chained);
        assert_eq!(chain.trigger.chain_depth, 1);
        assert_eq!(chain.trigger.parent_execution_id, Some(parent.id));
        assert_eq!(chain.trigger.variables["rows"], json!(12));
        assert_eq!(chain.trigger.variables["label"], json!("eu-daily"));
    }

    #[tokio::test]
    async fn test_condition_guard() {
        let chains = ChainRegistry::new();
        let inline = vec![
            ChainRule::on_completed("big").with_condition("tasks.fetch.output.rows > 100"),
            ChainRule::on_completed("small").with_condition(
                "execution.status == 'completed' && variables.region == 'eu'",
            ),
        ];
        let planned = chains
            .plan(&finished(ExecutionStatus::Completed, 0), &fetched(), &inline, 5)
            .await;
        let targets: Vec<&str> = planned.iter().map(|p| p.target.as_str()).collect();
        assert_eq!(targets, vec!["small"]);
    }

    #[tokio::test]
    async fn test_depth_guard_drops_triggers() {
        let chains = ChainRegistry::new();
        chains.register("ingest", ChainRule::on_completed("ingest")).await;

        let at_limit = finished(ExecutionStatus::Completed, 2);
        assert_eq!(chains.plan(&at_limit, &[], &[], 3).await.len(), 1);

        let past_limit = finished(ExecutionStatus::Completed, 3);
        assert!(chains.plan(&past_limit, &[], &[], 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_mapping_skips_rule_only() {
        let chains = ChainRegistry::new();
        let inline = vec![
            ChainRule::on_completed("broken").with_variable("x", json!("{{ tasks.ghost.output }}")),
            ChainRule::on_completed("fine").with_version(VersionReq::parse("^1").unwrap()),
        ];
        let planned = chains
            .plan(&finished(ExecutionStatus::Completed, 0), &[], &inline, 5)
            .await;
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].target, "fine");
        assert_eq!(planned[0].version, Some(VersionReq::parse("^1").unwrap()));
    }

    #[tokio::test]
    async fn test_unregister() {
        let chains = ChainRegistry::new();
        chains.register("a", ChainRule::on_completed("b")).await;
        chains.register("a", ChainRule::on_completed("c")).await;
        assert_eq!(chains.unregister("a").await, 2);
        assert!(chains.rules_for("a").await.is_empty());
    }
}
