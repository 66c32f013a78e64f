//! Orchestration engine and repository trait definitions for Taskweave.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the engine itself: dependency graphs, expression
//! resolution, retry, circuit breaking, the task pool, fan-out, execution
//! state, and workflow chaining. It depends only on `taskweave-types` --
//! never on `taskweave-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
