//! Application state wiring the scheduler to durable storage.
//!
//! The scheduler is generic over its repository; AppState pins it to the
//! SQLite implementation in the data directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use weft_core::workflow::InstanceScheduler;
use weft_infra::config::load_engine_config;
use weft_infra::filesystem::ensure_data_dir;
use weft_infra::sqlite::{DatabasePool, SqliteWorkflowRepository};
use weft_types::config::EngineConfig;

use crate::patterns::builtin_registry;

pub type ConcreteScheduler = InstanceScheduler<SqliteWorkflowRepository>;

/// Shared state for every command.
pub struct AppState {
    pub scheduler: Arc<ConcreteScheduler>,
    pub config: EngineConfig,
}

impl AppState {
    /// Load config from `data_dir`, open the database there and register the
    /// built-in workflows.
    pub async fn init_in(data_dir: PathBuf) -> anyhow::Result<Self> {
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::open_in(&data_dir)
            .await
            .with_context(|| format!("cannot open database in {}", data_dir.display()))?;
        let repo = SqliteWorkflowRepository::new(pool);
        let registry = builtin_registry()?;

        tracing::debug!(data_dir = %data_dir.display(), "application state initialised");
        Ok(Self {
            scheduler: Arc::new(InstanceScheduler::new(
                Arc::new(registry),
                Arc::new(repo),
                config.clone(),
            )),
            config,
        })
    }
}
