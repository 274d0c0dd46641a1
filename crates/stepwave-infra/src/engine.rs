//! Production wiring of the workflow engine onto SQLite.

use stepwave_core::event::EventBus;
use stepwave_core::workflow::{JexlEvaluator, WorkflowEngine};
use stepwave_types::config::EngineConfig;

use crate::sqlite::lease::SqliteLeaseStore;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::workflow::SqliteWorkflowRepository;

/// The engine as deployed: SQLite store and leases, JEXL evaluator.
pub type SqliteEngine = WorkflowEngine<SqliteWorkflowRepository, SqliteLeaseStore, JexlEvaluator>;

/// Build an engine sharing one database pool for steps and leases.
pub fn build_engine(pool: DatabasePool, events: EventBus, config: EngineConfig) -> SqliteEngine {
    WorkflowEngine::new(
        SqliteWorkflowRepository::new(pool.clone()),
        SqliteLeaseStore::new(pool),
        JexlEvaluator::new(),
        events,
        config,
    )
}
