//! Event types for the Stepwave engine event bus.
//!
//! `EngineEvent` is broadcast as instances and steps move through their
//! lifecycles. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{InstanceStatus, StepStatus};

/// Events emitted by the workflow engine.
///
/// Consumed by status observers (SSE stream, CLI `--wait`) to react before
/// their next poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new instance was created and its first wave seeded.
    InstanceCreated { instance_id: Uuid, template_id: String },

    /// A wave's step entries were inserted.
    WaveMaterialized {
        instance_id: Uuid,
        order: u32,
        steps: usize,
    },

    /// A step changed status.
    StepStatusChanged {
        instance_id: Uuid,
        step_id: Uuid,
        slot_key: String,
        order: u32,
        status: StepStatus,
    },

    /// An instance reached a terminal status.
    InstanceFinished {
        instance_id: Uuid,
        status: InstanceStatus,
    },
}

impl EngineEvent {
    /// The instance this event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::InstanceCreated { instance_id, .. }
            | EngineEvent::WaveMaterialized { instance_id, .. }
            | EngineEvent::StepStatusChanged { instance_id, .. }
            | EngineEvent::InstanceFinished { instance_id, .. } => *instance_id,
        }
    }
}
