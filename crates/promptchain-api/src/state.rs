//! Application state wiring the engine to its concrete infrastructure.
//!
//! The controller is generic over repository and provider traits; AppState
//! pins it to SQLite and the OpenAI-compatible client. Used by both the CLI
//! and the REST API.

use std::path::PathBuf;
use std::sync::Arc;

use promptchain_core::event::EventBus;
use promptchain_core::workflow::ExecutionController;
use promptchain_infra::config::{load_global_config, resolve_data_dir};
use promptchain_infra::llm::create_provider;
use promptchain_infra::llm::openai_compat::OpenAiCompatibleProvider;
use promptchain_infra::sqlite::pool::DatabasePool;
use promptchain_infra::sqlite::workflow::SqliteWorkflowRepository;
use promptchain_types::config::GlobalConfig;
use uuid::Uuid;

/// Concrete controller type pinned to the infra implementations.
pub type Engine = ExecutionController<SqliteWorkflowRepository, OpenAiCompatibleProvider>;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 256;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize from the resolved data directory and its `config.toml`.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let config = load_global_config(&data_dir).await;
        Self::init_at(data_dir, config).await
    }

    /// Initialize against an explicit data directory and config.
    pub async fn init_at(data_dir: PathBuf, config: GlobalConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_pool = DatabasePool::open(&data_dir).await?;
        let repo = SqliteWorkflowRepository::new(db_pool);
        let provider = create_provider(&config)?;
        let engine = ExecutionController::new(repo, provider, EventBus::new(EVENT_CAPACITY), &config);

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
            data_dir,
        })
    }

    /// Drive an execution on a background task until it pauses or finishes.
    ///
    /// Errors are logged; the persisted execution records the outcome.
    pub fn spawn_advance(&self, execution_id: Uuid) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.advance(execution_id).await {
                Ok(execution) => tracing::debug!(
                    execution_id = %execution_id,
                    status = %execution.status,
                    "background advance finished"
                ),
                Err(e) => tracing::warn!(
                    execution_id = %execution_id,
                    error = %e,
                    "background advance stopped with an error"
                ),
            }
        });
    }
}
