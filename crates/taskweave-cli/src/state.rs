//! Application state wiring the engine to the SQLite store.
//!
//! `AppState` pins the generic engine to `SqliteExecutionStore` and the
//! built-in capabilities.

use std::path::PathBuf;

use anyhow::Context;
use taskweave_core::workflow::engine::OrchestrationEngine;
use taskweave_infra::config::{data_dir, default_config_path, load_engine_config};
use taskweave_infra::sqlite::execution::SqliteExecutionStore;
use taskweave_infra::sqlite::pool::{DatabasePool, database_url_in};
use taskweave_types::config::EngineConfig;

use crate::builtins::builtin_registry;

pub type ConcreteEngine = OrchestrationEngine<SqliteExecutionStore>;

/// Shared state for every command.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub config: EngineConfig,
}

impl AppState {
    /// Resolve the data directory, load config, open the database, and build
    /// the engine. `configure` may adjust the loaded config before the engine
    /// is built.
    pub async fn init(
        data_dir_override: Option<PathBuf>,
        config_path: Option<PathBuf>,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> anyhow::Result<Self> {
        let data_dir = data_dir_override.unwrap_or_else(data_dir);

        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config_path = config_path.unwrap_or_else(|| default_config_path(&data_dir));
        let mut config = load_engine_config(&config_path).await;
        configure(&mut config);

        let db_pool = DatabasePool::new(&database_url_in(&data_dir))
            .await
            .context("Failed to open the execution database")?;
        let store = SqliteExecutionStore::new(db_pool);

        let engine = OrchestrationEngine::builder(store)
            .config(config.clone())
            .capabilities(builtin_registry())
            .build();

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self { engine, config })
    }
}
