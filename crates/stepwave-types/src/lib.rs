//! Shared domain types for Stepwave.
//!
//! Workflow templates, instances, step entries, step definitions, engine
//! events, lease keys, configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod lease;
pub mod workflow;
