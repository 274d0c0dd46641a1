//! SQLite storage layer.
//!
//! Repository and lease store implementations backed by SQLite with WAL mode
//! and split read/write connection pools.

pub mod lease;
pub mod pool;
pub mod workflow;
