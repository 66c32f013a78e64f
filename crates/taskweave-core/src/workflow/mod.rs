//! Workflow orchestration: definitions, scheduling, and durable execution state.
//!
//! Leaf-first:
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `dag` -- dependency graph builder with cycle detection
//! - `resolver` -- `{{ ... }}` placeholder resolution against execution state
//! - `expression` -- JEXL evaluator for task conditions and chain guards
//! - `capability` -- capability trait and registry (agent_type/action dispatch)
//! - `circuit` -- per-capability circuit breakers
//! - `retry` -- retry/backoff around one task invocation
//! - `fanout` -- batched fan-out over a collection with aggregation
//! - `pool` -- per-execution scheduler with bounded concurrency
//! - `state` -- lifecycle-aware execution state manager
//! - `catalog` -- versioned workflow catalog
//! - `chain` -- cross-workflow chain rules
//! - `engine` -- the orchestration engine composing all of the above

pub mod capability;
pub mod catalog;
pub mod chain;
pub mod circuit;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod fanout;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod state;
