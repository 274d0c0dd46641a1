//! Workflow domain types for the Stepwave engine.
//!
//! Defines the persisted shapes the engine works on: workflow templates and
//! the instances created from them, the per-step queue entries that track
//! execution attempts, and the immutable step definitions the engine looks up
//! but never mutates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Ordered wave table: wave number -> slot key -> slot.
pub type WaveTable = BTreeMap<u32, BTreeMap<String, WaveSlot>>;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A workflow template: the blueprint an instance is created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template identifier (referenced by instances).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Template-level context values seeded into every instance.
    #[serde(default)]
    pub internal_json: Map<String, Value>,
    /// Declared waves.
    pub waves: WaveTable,
}

/// One slot inside a wave: which step definition runs there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveSlot {
    /// ID of the step definition executed in this slot.
    pub definition_id: String,
    /// Explicit input mapping (`parameter -> context key`). Overrides
    /// name-based auto-mapping for the listed parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<BTreeMap<String, String>>,
}

impl WaveSlot {
    pub fn new(definition_id: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            input_mapping: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    CompletedWithBreak,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::CompletedWithBreak => "completed_with_break",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step entry.
///
/// ```text
/// pending -> initializing -> executing -> finalizing -> completed | failed
/// failed -> pending                (retry)
/// any non-terminal -> skipped      (control-flow override)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Initializing,
    Executing,
    Finalizing,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// States a worker is actively holding (heartbeat expected).
    pub const IN_FLIGHT: [StepStatus; 3] = [
        StepStatus::Initializing,
        StepStatus::Executing,
        StepStatus::Finalizing,
    ];

    /// States that can still be overridden to `skipped`.
    pub const SKIPPABLE: [StepStatus; 5] = [
        StepStatus::Pending,
        StepStatus::Initializing,
        StepStatus::Executing,
        StepStatus::Finalizing,
        StepStatus::Failed,
    ];

    pub fn is_in_flight(self) -> bool {
        Self::IN_FLIGHT.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Initializing => "initializing",
            StepStatus::Executing => "executing",
            StepStatus::Finalizing => "finalizing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a step's wave may advance.
///
/// `R` advances as soon as this step completes; `RW` waits for the whole wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    #[serde(rename = "R")]
    R,
    #[default]
    #[serde(rename = "RW")]
    RW,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::R => "R",
            RunMode::RW => "RW",
        }
    }
}

// ---------------------------------------------------------------------------
// Status history
// ---------------------------------------------------------------------------

/// One entry of a status-history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub message: String,
}

/// Close the open entry (if any) and append a new one.
pub fn push_history(
    history: &mut Vec<StatusHistoryEntry>,
    status: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    if let Some(last) = history.last_mut() {
        if last.end_time.is_none() {
            last.end_time = Some(now);
        }
    }
    history.push(StatusHistoryEntry {
        status: status.to_string(),
        start_time: now,
        end_time: None,
        message: message.into(),
    });
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: String,
    /// Template context merged with the caller-supplied context.
    pub internal_json: Map<String, Value>,
    pub waves: WaveTable,
    pub status: InstanceStatus,
    /// Set by a `break` control decision; no new waves are materialized.
    pub workflow_broken: bool,
    /// Waves jumped over by a forward `continue`; never materialized.
    pub skipped_orders: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_active: bool,
    pub status_history: Vec<StatusHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Build a fresh `running` instance from a template and caller context.
    ///
    /// Caller context keys win over template keys.
    pub fn from_template(template: &WorkflowTemplate, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        let mut internal_json = template.internal_json.clone();
        internal_json.extend(context);

        let mut status_history = Vec::new();
        push_history(
            &mut status_history,
            InstanceStatus::Running.as_str(),
            format!("instance created from template '{}'", template.id),
            now,
        );

        Self {
            id: Uuid::now_v7(),
            template_id: template.id.clone(),
            internal_json,
            waves: template.waves.clone(),
            status: InstanceStatus::Running,
            workflow_broken: false,
            skipped_orders: BTreeSet::new(),
            heartbeat_at: Some(now),
            heartbeat_active: true,
            status_history,
            created_at: now,
            updated_at: now,
        }
    }

    /// Highest declared wave number.
    pub fn max_order(&self) -> Option<u32> {
        self.waves.keys().next_back().copied()
    }

    /// Lowest declared wave number.
    pub fn first_order(&self) -> Option<u32> {
        self.waves.keys().next().copied()
    }

    /// The next declared wave after `order` that was not jumped over.
    pub fn next_order_after(&self, order: u32) -> Option<u32> {
        self.waves
            .range(order.saturating_add(1)..)
            .map(|(o, _)| *o)
            .find(|o| !self.skipped_orders.contains(o))
    }

    /// Wave number that declares the given slot key.
    pub fn order_of_slot(&self, slot_key: &str) -> Option<u32> {
        self.waves
            .iter()
            .find(|(_, slots)| slots.contains_key(slot_key))
            .map(|(o, _)| *o)
    }
}

// ---------------------------------------------------------------------------
// Step entry
// ---------------------------------------------------------------------------

/// One step execution entry within an instance (the step queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Wave number.
    pub order: u32,
    pub slot_key: String,
    pub definition_id: String,
    pub status: StepStatus,
    pub run_mode: RunMode,
    pub retry_count: u32,
    /// When a retry reset is due. Set only while a retry is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status_history: Vec<StatusHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepEntry {
    /// A new `pending` entry for a wave slot.
    pub fn pending(
        instance_id: Uuid,
        order: u32,
        slot_key: impl Into<String>,
        definition_id: impl Into<String>,
        run_mode: RunMode,
    ) -> Self {
        let now = Utc::now();
        let mut status_history = Vec::new();
        push_history(
            &mut status_history,
            StepStatus::Pending.as_str(),
            format!("queued in wave {order}"),
            now,
        );
        Self {
            id: Uuid::now_v7(),
            instance_id,
            order,
            slot_key: slot_key.into(),
            definition_id: definition_id.into(),
            status: StepStatus::Pending,
            run_mode,
            retry_count: 0,
            retry_at: None,
            heartbeat_at: None,
            heartbeat_active: false,
            output: None,
            error: None,
            status_history,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the step can no longer change on its own.
    ///
    /// A `failed` step with a scheduled retry is still live.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            StepStatus::Completed | StepStatus::Skipped => true,
            StepStatus::Failed => self.retry_at.is_none(),
            _ => false,
        }
    }

    /// Failed with no retry left.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == StepStatus::Failed && self.retry_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Step definitions (external registry)
// ---------------------------------------------------------------------------

/// Immutable function / control-step descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub inputs: Vec<ParamSpec>,
    #[serde(default)]
    pub outputs: Vec<ParamSpec>,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Definition-level context values.
    #[serde(default)]
    pub internal_json: Map<String, Value>,
}

impl StepDefinition {
    pub fn is_control(&self) -> bool {
        matches!(self.kind, StepKind::Control { .. })
    }
}

/// What a step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Business logic evaluated by the sandboxed evaluator.
    Function { body: String },
    /// A one-line `if <condition>: <action> [<target>];` directive.
    Control { expression: String },
}

/// Declared input or output parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Control decisions
// ---------------------------------------------------------------------------

/// What the wave scheduler should do after a step completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    Proceed,
    Continue,
    Break,
    Wait,
}

/// Result of evaluating a control step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDecision {
    pub action: FlowAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<String>,
    pub condition_met: bool,
}

impl ControlDecision {
    pub fn proceed() -> Self {
        Self {
            action: FlowAction::Proceed,
            target_step: None,
            condition_met: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Full status view of an instance, as returned to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    pub steps: Vec<StepEntry>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
