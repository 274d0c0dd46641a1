//! Application state wiring the engine to its infrastructure.
//!
//! AppState holds the SQLite-backed engine used by both the CLI and the
//! REST API, plus the resolved data directory and configuration.

use std::path::PathBuf;

use stepwave_core::event::EventBus;
use stepwave_infra::config::{load_global_config, resolve_data_dir};
use stepwave_infra::engine::{SqliteEngine, build_engine};
use stepwave_infra::sqlite::pool::DatabasePool;
use stepwave_types::config::GlobalConfig;

/// Shared application state.
///
/// Cheap to clone: the engine is a handle over shared state.
#[derive(Clone)]
pub struct AppState {
    pub engine: SqliteEngine,
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database,
    /// and build the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("stepwave.db").display()
        );
        let db_pool = DatabasePool::new(&db_url).await?;

        Ok(Self::from_parts(db_pool, config, data_dir))
    }

    pub fn from_parts(db_pool: DatabasePool, config: GlobalConfig, data_dir: PathBuf) -> Self {
        let engine = build_engine(db_pool, EventBus::default(), config.engine.clone());
        Self {
            engine,
            config,
            data_dir,
        }
    }
}
