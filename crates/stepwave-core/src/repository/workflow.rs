//! Workflow repository trait definition.
//!
//! Defines the storage interface for step definitions, workflow instances,
//! and step entries. The infrastructure layer (stepwave-infra) implements
//! this trait with SQLite persistence.

use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwave_types::error::RepositoryError;
use stepwave_types::workflow::{
    InstanceStatus, StepDefinition, StepEntry, StepStatus, WorkflowInstance,
};
use uuid::Uuid;

/// A conditional status change for one step entry.
///
/// Applied only when the stored status is one of the `from` states passed
/// alongside it. A successful write appends a history entry (closing the
/// previous one) and stamps `updated_at`.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub status: StepStatus,
    /// Human-readable history message.
    pub message: String,
    /// Replaces the stored output when present.
    pub output: Option<Value>,
    /// Replaces the stored error when present.
    pub error: Option<String>,
    /// Always written: `Some` schedules a retry, `None` clears it.
    pub retry_at: Option<DateTime<Utc>>,
    /// Increment `retry_count` in the same write.
    pub increment_retry: bool,
}

impl StepUpdate {
    pub fn new(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            output: None,
            error: None,
            retry_at: None,
            increment_retry: false,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }

    pub fn incrementing_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }
}

/// Repository trait for workflow engine persistence.
///
/// Covers three entity families:
/// - **Definitions:** the external step/function registry (read-mostly).
/// - **Instances:** workflow runs, their status, flags and heartbeat.
/// - **Steps:** step queue entries, their state machine and heartbeat.
///
/// Every mutating method is a single-record write; conditional methods
/// report whether the condition held so callers can back off on lost races.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a step definition.
    fn save_definition(
        &self,
        def: &StepDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a step definition by ID.
    fn get_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance record.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an instance by ID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances currently in the given status, oldest first.
    fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Move a `running` instance to a terminal status and deactivate its
    /// heartbeat. Returns `false` if the instance was no longer running.
    fn finish_instance(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        message: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Set `workflow_broken` on an instance.
    fn mark_instance_broken(
        &self,
        id: &Uuid,
        message: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Add and remove wave numbers in `skipped_orders` in one write.
    fn update_skipped_orders(
        &self,
        id: &Uuid,
        add: &[u32],
        remove: &[u32],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Refresh `heartbeat_at` if `heartbeat_active` is still set.
    /// Returns `false` when the flag was already cleared.
    fn touch_instance_heartbeat(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Set `heartbeat_active` (and stamp `heartbeat_at` when activating).
    fn set_instance_heartbeat_active(
        &self,
        id: &Uuid,
        active: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Running instances whose heartbeat is older than `cutoff`.
    fn list_stale_instances(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert step entries, ignoring any whose `(instance, order, slot_key)`
    /// already exists. Returns the number actually inserted.
    fn insert_steps(
        &self,
        steps: &[StepEntry],
    ) -> impl std::future::Future<Output = Result<usize, RepositoryError>> + Send;

    /// Get a step entry by ID.
    fn get_step(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepEntry>, RepositoryError>> + Send;

    /// All step entries of an instance, ordered by wave then slot key.
    fn list_steps(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepEntry>, RepositoryError>> + Send;

    /// Apply `update` if the step's status is one of `from`.
    fn transition_step(
        &self,
        id: &Uuid,
        from: &[StepStatus],
        update: &StepUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Refresh `heartbeat_at` if `heartbeat_active` is still set.
    fn touch_step_heartbeat(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Set `heartbeat_active` (and stamp `heartbeat_at` when activating).
    fn set_step_heartbeat_active(
        &self,
        id: &Uuid,
        active: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// In-flight steps whose heartbeat (or last update, if none) is older
    /// than `cutoff`.
    fn list_stale_steps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<StepEntry>, RepositoryError>> + Send;
}
