//! Lease keys for the engine's wave-level mutual exclusion.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which wave decision a lease serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePurpose {
    /// Deciding whether a finished wave advances.
    WaveCompletion,
    /// Inserting a wave's step entries.
    WaveInsertion,
}

impl LeasePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            LeasePurpose::WaveCompletion => "wave_completion",
            LeasePurpose::WaveInsertion => "wave_insertion",
        }
    }
}

/// Identity of one lease: `(instance, wave, purpose)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseKey {
    pub instance_id: Uuid,
    pub order: u32,
    pub purpose: LeasePurpose,
}

impl LeaseKey {
    pub fn completion(instance_id: Uuid, order: u32) -> Self {
        Self {
            instance_id,
            order,
            purpose: LeasePurpose::WaveCompletion,
        }
    }

    pub fn insertion(instance_id: Uuid, order: u32) -> Self {
        Self {
            instance_id,
            order,
            purpose: LeasePurpose::WaveInsertion,
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.instance_id,
            self.order,
            self.purpose.as_str()
        )
    }
}
