//! Shared domain types for Taskweave.
//!
//! This crate contains the core domain types used across the orchestration
//! engine: workflow definitions, execution records, task results, engine
//! events, configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
