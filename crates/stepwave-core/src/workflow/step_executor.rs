//! Single-step execution.
//!
//! Runs one step entry through its state machine:
//!
//! ```text
//! pending -> initializing -> executing -> finalizing -> completed
//!                     \___________\____________\______-> failed
//! ```
//!
//! Every transition is a conditional write. Losing one means another actor
//! (a control-flow override, the health monitor, recovery) has taken the
//! step, and this attempt silently stops.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use stepwave_types::workflow::{
    ControlDecision, FlowAction, ParamSpec, StepDefinition, StepEntry, StepKind, StepStatus,
    WaveSlot, WorkflowInstance,
};
use uuid::Uuid;

use super::control::{evaluate_directive, parse_directive};
use super::engine::WorkflowEngine;
use super::evaluator::Evaluator;
use super::heartbeat::HeartbeatTarget;
use super::lease::LeaseStore;
use crate::repository::workflow::{StepUpdate, WorkflowRepository};

/// Keys unwrapped from a single-key evaluator result.
const OUTPUT_WRAPPER_KEYS: [&str; 3] = ["result", "data", "output"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a step attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("step definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("invalid control directive: {0}")]
    InvalidControl(String),

    #[error("continue target '{0}' is not declared in any wave")]
    UnknownTarget(String),

    #[error("required input '{0}' is not available")]
    MissingInput(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("required output '{0}' was not produced")]
    MissingOutput(String),

    #[error("store error: {0}")]
    Store(String),
}

impl StepError {
    /// Definition errors are never retried; execution errors are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::Evaluation(_)
                | StepError::Timeout(_)
                | StepError::MissingOutput(_)
                | StepError::Store(_)
        )
    }
}

impl From<stepwave_types::error::RepositoryError> for StepError {
    fn from(e: stepwave_types::error::RepositoryError) -> Self {
        StepError::Store(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Input / output helpers
// ---------------------------------------------------------------------------

/// Resolve a definition's declared inputs from the instance context.
///
/// An explicit slot mapping (`parameter -> context key`) wins; otherwise the
/// parameter name itself is looked up. Missing optional inputs are omitted.
pub fn map_inputs(
    inputs: &[ParamSpec],
    slot: Option<&WaveSlot>,
    context: &Map<String, Value>,
) -> Result<Map<String, Value>, StepError> {
    let mapping: Option<&BTreeMap<String, String>> = slot.and_then(|s| s.input_mapping.as_ref());
    let mut mapped = Map::new();

    for param in inputs {
        let source = mapping
            .and_then(|m| m.get(&param.name))
            .map(String::as_str)
            .unwrap_or(param.name.as_str());
        match context.get(source) {
            Some(value) => {
                mapped.insert(param.name.clone(), value.clone());
            }
            None if param.required => return Err(StepError::MissingInput(param.name.clone())),
            None => {}
        }
    }
    Ok(mapped)
}

/// Evaluation context for a function body.
///
/// Later layers win: definition context, then instance context, then mapped
/// inputs.
pub fn build_eval_context(
    definition: &StepDefinition,
    instance: &WorkflowInstance,
    inputs: Map<String, Value>,
) -> Value {
    let mut merged = definition.internal_json.clone();
    merged.extend(instance.internal_json.clone());
    merged.extend(inputs);
    Value::Object(merged)
}

/// Unwrap a `{result|data|output: ...}` single-key wrapper.
pub fn normalize_output(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 => {
            let key = OUTPUT_WRAPPER_KEYS
                .iter()
                .find(|k| map.contains_key(**k))
                .copied();
            match key.and_then(|k| map.remove(k)) {
                Some(inner) => inner,
                None => Value::Object(map),
            }
        }
        other => other,
    }
}

/// Keep only the declared outputs.
///
/// With no declared outputs the value passes through unchanged. A scalar
/// result is accepted when exactly one output is declared.
pub fn collect_outputs(outputs: &[ParamSpec], value: Value) -> Result<Value, StepError> {
    if outputs.is_empty() {
        return Ok(value);
    }

    let map = match value {
        Value::Object(map) => map,
        scalar if outputs.len() == 1 => {
            let mut map = Map::new();
            map.insert(outputs[0].name.clone(), scalar);
            return Ok(Value::Object(map));
        }
        _ => {
            return Err(StepError::MissingOutput(outputs[0].name.clone()));
        }
    };

    let mut collected = Map::new();
    for param in outputs {
        match map.get(&param.name) {
            Some(value) => {
                collected.insert(param.name.clone(), value.clone());
            }
            None if param.required => return Err(StepError::MissingOutput(param.name.clone())),
            None => {}
        }
    }
    Ok(Value::Object(collected))
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Outcome of a step attempt that did not error.
enum StepRun {
    Completed {
        output: Value,
        decision: ControlDecision,
    },
    /// A conditional transition was lost; someone else owns the step.
    Overridden,
}

impl<R, L, E> WorkflowEngine<R, L, E>
where
    R: WorkflowRepository + 'static,
    L: LeaseStore + 'static,
    E: Evaluator + 'static,
{
    /// Run a step on a background task.
    pub(crate) fn spawn_step(&self, step: StepEntry) {
        if self.is_shutting_down() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            engine.execute_step(step).await;
        });
    }

    async fn execute_step(&self, step: StepEntry) {
        let claimed = self
            .transition(
                &step,
                &[StepStatus::Pending],
                StepUpdate::new(StepStatus::Initializing, "claimed for execution"),
            )
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(step_id = %step.id, error = %e, "failed to claim step");
                return;
            }
        }

        let target = HeartbeatTarget::Step(step.id);
        if let Err(e) = self.heartbeats().start(target).await {
            tracing::warn!(step_id = %step.id, error = %e, "failed to start step heartbeat");
        }

        let outcome = self.run_step(&step).await;
        self.heartbeats().stop(target).await;

        match outcome {
            Ok(StepRun::Completed { output, decision }) => {
                let completed = self
                    .transition(
                        &step,
                        &[StepStatus::Finalizing],
                        StepUpdate::new(StepStatus::Completed, completion_message(&decision))
                            .with_output(output),
                    )
                    .await;
                match completed {
                    Ok(true) => {
                        tracing::info!(
                            instance_id = %step.instance_id,
                            slot = %step.slot_key,
                            order = step.order,
                            action = ?decision.action,
                            "step completed"
                        );
                        if let Err(e) = self.on_step_settled(&step, &decision).await {
                            tracing::error!(
                                instance_id = %step.instance_id,
                                step_id = %step.id,
                                error = %e,
                                "failed to advance after step completion"
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(step_id = %step.id, error = %e, "failed to record completion");
                    }
                }
            }
            Ok(StepRun::Overridden) => {
                tracing::debug!(step_id = %step.id, "step overridden mid-flight");
            }
            Err(err) => self.fail_step(&step, err).await,
        }
    }

    async fn run_step(&self, step: &StepEntry) -> Result<StepRun, StepError> {
        let definition = self
            .repo()
            .get_definition(&step.definition_id)
            .await?
            .ok_or_else(|| StepError::DefinitionNotFound(step.definition_id.clone()))?;
        let instance = self
            .repo()
            .get_instance(&step.instance_id)
            .await?
            .ok_or(StepError::InstanceNotFound(step.instance_id))?;

        match &definition.kind {
            StepKind::Control { expression } => {
                self.run_control(step, &instance, expression).await
            }
            StepKind::Function { body } => {
                self.run_function(step, &definition, &instance, body).await
            }
        }
    }

    async fn run_control(
        &self,
        step: &StepEntry,
        instance: &WorkflowInstance,
        expression: &str,
    ) -> Result<StepRun, StepError> {
        let directive =
            parse_directive(expression).map_err(|e| StepError::InvalidControl(e.to_string()))?;

        if !self
            .advance(step, StepStatus::Initializing, StepStatus::Executing, "evaluating control condition")
            .await?
        {
            return Ok(StepRun::Overridden);
        }

        let context = Value::Object(instance.internal_json.clone());
        let decision = tokio::time::timeout(
            self.config().step_timeout(),
            evaluate_directive(&directive, &context, self.evaluator()),
        )
        .await
        .map_err(|_| StepError::Timeout(self.config().step_timeout()))?
        .map_err(|e| StepError::Evaluation(e.to_string()))?;

        if decision.action == FlowAction::Continue {
            let target = decision.target_step.as_deref().unwrap_or_default();
            if instance.order_of_slot(target).is_none() {
                return Err(StepError::UnknownTarget(target.to_string()));
            }
        }

        if !self
            .advance(step, StepStatus::Executing, StepStatus::Finalizing, "recording control decision")
            .await?
        {
            return Ok(StepRun::Overridden);
        }

        let output = serde_json::to_value(&decision).map_err(|e| StepError::Store(e.to_string()))?;
        Ok(StepRun::Completed { output, decision })
    }

    async fn run_function(
        &self,
        step: &StepEntry,
        definition: &StepDefinition,
        instance: &WorkflowInstance,
        body: &str,
    ) -> Result<StepRun, StepError> {
        let slot = instance
            .waves
            .get(&step.order)
            .and_then(|slots| slots.get(&step.slot_key));
        let inputs = map_inputs(&definition.inputs, slot, &instance.internal_json)?;

        if !self
            .advance(step, StepStatus::Initializing, StepStatus::Executing, "running function body")
            .await?
        {
            return Ok(StepRun::Overridden);
        }

        let context = build_eval_context(definition, instance, inputs);
        let raw = tokio::time::timeout(
            self.config().step_timeout(),
            self.evaluator().run_body(body, &context),
        )
        .await
        .map_err(|_| StepError::Timeout(self.config().step_timeout()))?
        .map_err(|e| StepError::Evaluation(e.to_string()))?;

        if !self
            .advance(step, StepStatus::Executing, StepStatus::Finalizing, "collecting outputs")
            .await?
        {
            return Ok(StepRun::Overridden);
        }

        let output = collect_outputs(&definition.outputs, normalize_output(raw))?;
        Ok(StepRun::Completed {
            output,
            decision: ControlDecision::proceed(),
        })
    }

    async fn advance(
        &self,
        step: &StepEntry,
        from: StepStatus,
        to: StepStatus,
        message: &str,
    ) -> Result<bool, StepError> {
        Ok(self
            .transition(step, &[from], StepUpdate::new(to, message))
            .await?)
    }

    /// Record a failed attempt and either schedule a retry or settle the
    /// step permanently.
    async fn fail_step(&self, step: &StepEntry, err: StepError) {
        let broken = match self.repo().get_instance(&step.instance_id).await {
            Ok(Some(instance)) => instance.workflow_broken,
            _ => false,
        };
        let retry = err.is_retryable() && !broken && self.inner.retry.should_retry(step.retry_count);
        let delay = self.inner.retry.backoff(step.retry_count);

        let update = if retry {
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            StepUpdate::new(
                StepStatus::Failed,
                format!(
                    "attempt {} failed: {err}; retrying in {delay:?}",
                    step.retry_count + 1
                ),
            )
            .with_error(err.to_string())
            .with_retry_at(retry_at)
        } else {
            StepUpdate::new(StepStatus::Failed, format!("failed permanently: {err}"))
                .with_error(err.to_string())
        };

        match self.transition(step, &StepStatus::IN_FLIGHT, update).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::error!(step_id = %step.id, error = %e, "failed to record step failure");
                return;
            }
        }

        if retry {
            tracing::warn!(
                instance_id = %step.instance_id,
                slot = %step.slot_key,
                retry_count = step.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "step failed, retry scheduled"
            );
            self.spawn_retry(step.clone(), delay);
        } else {
            tracing::error!(
                instance_id = %step.instance_id,
                slot = %step.slot_key,
                retry_count = step.retry_count,
                error = %err,
                "step failed permanently"
            );
            if let Err(e) = self.complete_wave(step.instance_id, step.order).await {
                tracing::error!(instance_id = %step.instance_id, error = %e, "wave completion check failed");
            }
        }
    }

    /// Reset a failed step to `pending` after its backoff delay.
    fn spawn_retry(&self, step: StepEntry, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            engine.fire_retry(&step).await;
        });
    }

    pub(crate) async fn fire_retry(&self, step: &StepEntry) {
        match self.load_instance(&step.instance_id).await {
            Ok(instance) if instance.status.is_terminal() => return,
            Ok(instance) if instance.workflow_broken => {
                if let Err(e) = self
                    .drain_broken(step.instance_id, "retry dropped after break")
                    .await
                {
                    tracing::error!(step_id = %step.id, error = %e, "failed to drain broken instance");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(step_id = %step.id, error = %e, "failed to load instance for retry");
                return;
            }
        }

        let update = StepUpdate::new(
            StepStatus::Pending,
            format!("retry {} queued", step.retry_count + 1),
        )
        .incrementing_retry();
        match self.transition(step, &[StepStatus::Failed], update).await {
            Ok(true) => self.spawn_scheduler(step.instance_id),
            Ok(false) => {}
            Err(e) => tracing::error!(step_id = %step.id, error = %e, "failed to requeue step"),
        }
    }
}

fn completion_message(decision: &ControlDecision) -> String {
    let action = match decision.action {
        FlowAction::Proceed => return "completed".to_string(),
        FlowAction::Continue => "continue",
        FlowAction::Break => "break",
        FlowAction::Wait => "wait",
    };
    match decision.target_step.as_deref() {
        Some(target) => format!("completed with {action} -> {target}"),
        None => format!("completed with {action}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(name: &str, required: bool) -> ParamSpec {
        ParamSpec {
            name: name.to_string(),
            required,
        }
    }

    fn ctx() -> Map<String, Value> {
        json!({"x": 10, "threshold": 5, "site": "plant-a"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_map_inputs_by_name() {
        let mapped = map_inputs(&[param("x", true)], None, &ctx()).unwrap();
        assert_eq!(mapped["x"], 10);
        assert_eq!(mapped.len(), 1);
    }

    #[test]
    fn test_map_inputs_explicit_mapping_wins() {
        let slot = WaveSlot {
            definition_id: "fn".to_string(),
            input_mapping: Some(BTreeMap::from([(
                "limit".to_string(),
                "threshold".to_string(),
            )])),
        };
        let mapped = map_inputs(&[param("limit", true)], Some(&slot), &ctx()).unwrap();
        assert_eq!(mapped["limit"], 5);
    }

    #[test]
    fn test_map_inputs_missing() {
        let err = map_inputs(&[param("y", true)], None, &ctx()).unwrap_err();
        assert!(matches!(err, StepError::MissingInput(ref n) if n == "y"));
        assert!(!err.is_retryable());

        let mapped = map_inputs(&[param("y", false)], None, &ctx()).unwrap();
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_normalize_output_unwraps_single_wrapper() {
        assert_eq!(normalize_output(json!({"result": {"y": 1}})), json!({"y": 1}));
        assert_eq!(normalize_output(json!({"data": 3})), json!(3));
        assert_eq!(
            normalize_output(json!({"output": 1, "other": 2})),
            json!({"output": 1, "other": 2})
        );
        assert_eq!(normalize_output(json!({"y": 1})), json!({"y": 1}));
        assert_eq!(normalize_output(json!(7)), json!(7));
    }

    #[test]
    fn test_collect_outputs() {
        let outputs = [param("sum", true), param("note", false)];
        let value = collect_outputs(&outputs, json!({"sum": 3, "extra": true})).unwrap();
        assert_eq!(value, json!({"sum": 3}));

        let err = collect_outputs(&outputs, json!({"extra": true})).unwrap_err();
        assert!(matches!(err, StepError::MissingOutput(ref n) if n == "sum"));
        assert!(err.is_retryable());

        let scalar = collect_outputs(&[param("sum", true)], json!(4)).unwrap();
        assert_eq!(scalar, json!({"sum": 4}));

        assert_eq!(collect_outputs(&[], json!([1, 2])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StepError::Evaluation("boom".into()).is_retryable());
        assert!(StepError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StepError::DefinitionNotFound("x".into()).is_retryable());
        assert!(!StepError::InvalidControl("x".into()).is_retryable());
        assert!(!StepError::UnknownTarget("x".into()).is_retryable());
    }

    #[test]
    fn test_completion_message() {
        assert_eq!(completion_message(&ControlDecision::proceed()), "completed");
        let decision = ControlDecision {
            action: FlowAction::Continue,
            target_step: Some("c".to_string()),
            condition_met: true,
        };
        assert_eq!(completion_message(&decision), "completed with continue -> c");
    }
}
