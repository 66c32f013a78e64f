//! SQLite storage layer.
//!
//! Execution store backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod execution;
pub mod pool;
