//! The workflow engine: public entry points and shared state.
//!
//! `WorkflowEngine` is a cheap-to-clone handle over `EngineInner`. All
//! background work (step execution, wave scheduling, retries, recovery
//! resumes) runs on spawned tokio tasks that hold a clone of the handle.
//! Every cross-task decision goes through the repository's conditional
//! writes or the lease store; no in-process lock guards engine state.

use std::sync::Arc;

use serde_json::{Map, Value};
use stepwave_types::config::EngineConfig;
use stepwave_types::error::RepositoryError;
use stepwave_types::event::EngineEvent;
use stepwave_types::workflow::{
    InstanceSnapshot, StepDefinition, StepEntry, StepKind, StepStatus, WorkflowInstance,
    WorkflowTemplate,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::control::parse_directive;
use super::evaluator::Evaluator;
use super::heartbeat::{HeartbeatRegistry, HeartbeatTarget};
use super::lease::{LeaseError, LeaseStore};
use super::retry::RetryPolicy;
use crate::event::EventBus;
use crate::repository::workflow::{StepUpdate, WorkflowRepository};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("workflow template '{0}' declares no waves")]
    EmptyTemplate(String),

    #[error("invalid step definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("engine is shutting down")]
    ShuttingDown,
}

pub(crate) struct EngineInner<R, L, E> {
    pub(crate) repo: Arc<R>,
    pub(crate) leases: L,
    pub(crate) evaluator: E,
    pub(crate) heartbeats: HeartbeatRegistry<R>,
    pub(crate) events: EventBus,
    pub(crate) config: EngineConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) shutdown: CancellationToken,
}

/// Durable, wave-based step execution engine.
pub struct WorkflowEngine<R, L, E> {
    pub(crate) inner: Arc<EngineInner<R, L, E>>,
}

impl<R, L, E> Clone for WorkflowEngine<R, L, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, L, E> WorkflowEngine<R, L, E>
where
    R: WorkflowRepository + 'static,
    L: LeaseStore + 'static,
    E: Evaluator + 'static,
{
    pub fn new(repo: R, leases: L, evaluator: E, events: EventBus, config: EngineConfig) -> Self {
        let repo = Arc::new(repo);
        let heartbeats = HeartbeatRegistry::new(
            Arc::clone(&repo),
            config.heartbeat_interval(),
            config.heartbeat_failure_limit,
        );
        let retry = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(EngineInner {
                repo,
                leases,
                evaluator,
                heartbeats,
                events,
                config,
                retry,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn repository(&self) -> &R {
        self.inner.repo.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn heartbeats(&self) -> &HeartbeatRegistry<R> {
        &self.inner.heartbeats
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn repo(&self) -> &R {
        self.inner.repo.as_ref()
    }

    pub(crate) fn leases(&self) -> &L {
        &self.inner.leases
    }

    pub(crate) fn evaluator(&self) -> &E {
        &self.inner.evaluator
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Validate and store a step definition.
    ///
    /// Control expressions are parsed here so malformed directives never
    /// reach a running instance.
    pub async fn register_definition(&self, def: &StepDefinition) -> Result<(), EngineError> {
        validate_definition(def)?;
        self.repo().save_definition(def).await?;
        tracing::info!(definition_id = %def.id, control = def.is_control(), "step definition registered");
        Ok(())
    }

    /// Create a running instance from a template and start its first wave.
    ///
    /// Returns once the first wave's step entries exist; execution
    /// continues in the background.
    pub async fn create_instance(
        &self,
        template: &WorkflowTemplate,
        context: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let Some(first_order) = template.waves.keys().next().copied() else {
            return Err(EngineError::EmptyTemplate(template.id.clone()));
        };

        let instance = WorkflowInstance::from_template(template, context);
        let instance_id = instance.id;
        self.repo().create_instance(&instance).await?;
        self.heartbeats()
            .start(HeartbeatTarget::Instance(instance_id))
            .await?;

        tracing::info!(
            %instance_id,
            template_id = %template.id,
            waves = template.waves.len(),
            "workflow instance created"
        );
        self.events().publish(EngineEvent::InstanceCreated {
            instance_id,
            template_id: template.id.clone(),
        });

        self.materialize_wave(instance_id, first_order).await?;
        self.spawn_scheduler(instance_id);
        Ok(instance_id)
    }

    /// Current instance record plus all of its step entries.
    pub async fn get_instance_status(&self, id: &Uuid) -> Result<InstanceSnapshot, EngineError> {
        let instance = self
            .repo()
            .get_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*id))?;
        let steps = self.repo().list_steps(id).await?;
        Ok(InstanceSnapshot { instance, steps })
    }

    /// Stop all local timers and background launches.
    ///
    /// Persisted state is left as-is; heartbeats go stale and another
    /// process (or this one, after restart) recovers the work.
    pub fn graceful_shutdown(&self) {
        self.inner.shutdown.cancel();
        self.heartbeats().shutdown();
        tracing::info!("workflow engine shut down");
    }

    // -----------------------------------------------------------------------
    // Shared internals
    // -----------------------------------------------------------------------

    /// Conditionally move a step and publish the change.
    pub(crate) async fn transition(
        &self,
        step: &StepEntry,
        from: &[StepStatus],
        update: StepUpdate,
    ) -> Result<bool, RepositoryError> {
        let moved = self.repo().transition_step(&step.id, from, &update).await?;
        if moved {
            tracing::debug!(
                instance_id = %step.instance_id,
                step_id = %step.id,
                slot = %step.slot_key,
                order = step.order,
                status = %update.status,
                message = %update.message,
                "step transition"
            );
            self.events().publish(EngineEvent::StepStatusChanged {
                instance_id: step.instance_id,
                step_id: step.id,
                slot_key: step.slot_key.clone(),
                order: step.order,
                status: update.status,
            });
        } else {
            tracing::debug!(
                step_id = %step.id,
                to = %update.status,
                "step transition lost race"
            );
        }
        Ok(moved)
    }

    pub(crate) async fn load_instance(&self, id: &Uuid) -> Result<WorkflowInstance, EngineError> {
        self.repo()
            .get_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*id))
    }
}

fn validate_definition(def: &StepDefinition) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidDefinition {
        id: def.id.clone(),
        reason,
    };

    if def.id.trim().is_empty() {
        return Err(invalid("id must not be empty".to_string()));
    }
    match &def.kind {
        StepKind::Function { body } if body.trim().is_empty() => {
            Err(invalid("function body must not be empty".to_string()))
        }
        StepKind::Function { .. } => Ok(()),
        StepKind::Control { expression } => parse_directive(expression)
            .map(|_| ())
            .map_err(|e| invalid(e.to_string())),
    }
}
