//! Workflow step-execution engine.
//!
//! - `engine` -- `WorkflowEngine` handle and its public entry points
//! - `scheduler` -- wave selection, materialization, control-flow dispatch
//! - `step_executor` -- single-step state machine and input/output handling
//! - `control` -- `if <cond>: <action> [target];` directive parsing
//! - `evaluator` -- sandboxed evaluator trait and the JEXL implementation
//! - `heartbeat` -- per-instance and per-step liveness timers
//! - `health` -- stale-heartbeat scan
//! - `recovery` -- startup re-adoption of running instances
//! - `retry` -- bounded exponential backoff
//! - `lease` -- lease store port for wave-level mutual exclusion

pub mod control;
pub mod engine;
pub mod evaluator;
pub mod health;
pub mod heartbeat;
pub mod lease;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod step_executor;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineError, WorkflowEngine};
pub use evaluator::{EvalError, Evaluator, JexlEvaluator};
pub use health::HealthReport;
pub use lease::{LeaseError, LeaseStore};
pub use recovery::RecoveryReport;
