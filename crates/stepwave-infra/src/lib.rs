//! Infrastructure layer for Stepwave.
//!
//! Implements the ports defined in `stepwave-core`: the SQLite workflow
//! repository and lease store, plus configuration and template/definition
//! file loading.

pub mod config;
pub mod engine;
pub mod sqlite;
