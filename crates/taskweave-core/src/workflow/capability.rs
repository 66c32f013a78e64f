//! Capability contract and registry.
//!
//! A capability is the opaque unit of work a task invokes:
//! `execute(action, parameters) -> output | CapabilityError`. The engine
//! routes each task to a capability by its `agent_type`, with optional
//! per-action overrides keyed by `agent_type.action`.
//!
//! Follows the blanket-impl pattern for dynamic dispatch:
//! 1. `Capability` uses native async fn in traits (RPITIT)
//! 2. Object-safe `CapabilityDyn` returns boxed futures
//! 3. Blanket-impl `CapabilityDyn` for all `T: Capability`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use taskweave_types::capability::CapabilityError;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An async unit of work addressable by tasks.
pub trait Capability: Send + Sync {
    fn execute(
        &self,
        action: &str,
        parameters: &Value,
    ) -> impl Future<Output = Result<Value, CapabilityError>> + Send;
}

/// Object-safe version of [`Capability`] with boxed futures.
pub trait CapabilityDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        action: &'a str,
        parameters: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>>;
}

impl<T: Capability> CapabilityDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        action: &'a str,
        parameters: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>> {
        Box::pin(self.execute(action, parameters))
    }
}

// ---------------------------------------------------------------------------
// FnCapability
// ---------------------------------------------------------------------------

/// Adapts an async closure `(action, parameters) -> Result<Value, CapabilityError>`.
pub struct FnCapability<F> {
    f: F,
}

impl<F, Fut> FnCapability<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    fn execute(
        &self,
        action: &str,
        parameters: &Value,
    ) -> impl Future<Output = Result<Value, CapabilityError>> + Send {
        (self.f)(action.to_string(), parameters.clone())
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

/// Maps capability keys to implementations.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    by_type: HashMap<String, Arc<dyn CapabilityDyn>>,
    by_action: HashMap<String, Arc<dyn CapabilityDyn>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle every action of `agent_type`.
    pub fn register<C: Capability + 'static>(&mut self, agent_type: impl Into<String>, capability: C) {
        self.by_type.insert(agent_type.into(), Arc::new(capability));
    }

    /// Handle one `agent_type.action`, taking precedence over the type-wide entry.
    pub fn register_action<C: Capability + 'static>(
        &mut self,
        agent_type: &str,
        action: &str,
        capability: C,
    ) {
        self.by_action
            .insert(format!("{agent_type}.{action}"), Arc::new(capability));
    }

    /// Register an async closure for every action of `agent_type`.
    pub fn register_fn<F, Fut>(&mut self, agent_type: impl Into<String>, f: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        self.register(agent_type, FnCapability::new(f));
    }

    pub fn resolve(&self, agent_type: &str, action: &str) -> Option<Arc<dyn CapabilityDyn>> {
        self.by_action
            .get(&format!("{agent_type}.{action}"))
            .or_else(|| self.by_type.get(agent_type))
            .cloned()
    }

    pub fn contains(&self, agent_type: &str, action: &str) -> bool {
        self.resolve(agent_type, action).is_some()
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&String> = self.by_action.keys().collect();
        actions.sort();
        f.debug_struct("CapabilityRegistry")
            .field("agent_types", &self.agent_types())
            .field("actions", &actions)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Capability for Upper {
        async fn execute(&self, action: &str, parameters: &Value) -> Result<Value, CapabilityError> {
            let text = parameters["text"].as_str().unwrap_or_default();
            Ok(json!({ "action": action, "text": text.to_uppercase() }))
        }
    }

    #[tokio::test]
    async fn test_struct_capability_through_dyn() {
        let mut registry = CapabilityRegistry::new();
        registry.register("text", Upper);

        let cap = registry.resolve("text", "shout").unwrap();
        let out = cap
            .execute_boxed("shout", &json!({ "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(out, json!({ "action": "shout", "text": "HI" }));
    }

    #[tokio::test]
    async fn test_action_override_wins() {
        let mut registry = CapabilityRegistry::new();
        registry.register("text", Upper);
        registry.register_action(
            "text",
            "fail",
            FnCapability::new(|_action, _params| async {
                Err(CapabilityError::invalid_input("nope"))
            }),
        );

        let err = registry
            .resolve("text", "fail")
            .unwrap()
            .execute_boxed("fail", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.message, "nope");
        assert!(registry.resolve("text", "other").is_some());
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("math", |_action, params| async move {
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let out = registry
            .resolve("math", "add")
            .unwrap()
            .execute_boxed("add", &json!({ "a": 2, "b": 3 }))
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[test]
    fn test_unknown_type_is_none() {
        let registry = CapabilityRegistry::new();
        assert!(registry.resolve("ghost", "run").is_none());
        assert!(!registry.contains("ghost", "run"));
    }
}
