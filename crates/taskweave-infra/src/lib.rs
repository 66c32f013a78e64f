//! Infrastructure layer for Taskweave.
//!
//! Contains the SQLite implementation of the `ExecutionStore` trait defined
//! in `taskweave-core`, plus data-directory and `config.toml` handling.

pub mod config;
pub mod sqlite;
