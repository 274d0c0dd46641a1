//! Heartbeat health scan.
//!
//! Finds in-flight steps and running instances whose heartbeat has gone
//! stale, presumes their worker dead, and puts the work back in play. A
//! stale step is reset to `pending` (at-least-once execution); a stale
//! instance gets a fresh heartbeat timer and a scheduling pass.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;
use stepwave_types::workflow::StepStatus;
use uuid::Uuid;

use super::engine::{EngineError, WorkflowEngine};
use super::evaluator::Evaluator;
use super::heartbeat::HeartbeatTarget;
use super::lease::LeaseStore;
use crate::repository::workflow::{StepUpdate, WorkflowRepository};

/// Outcome of one health scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Stale steps reset to `pending`.
    pub steps_reset: usize,
    /// Running instances whose heartbeat was restarted.
    pub instances_revived: usize,
    /// Instances that were handed back to the scheduler.
    pub rescheduled: Vec<Uuid>,
}

impl<R, L, E> WorkflowEngine<R, L, E>
where
    R: WorkflowRepository + 'static,
    L: LeaseStore + 'static,
    E: Evaluator + 'static,
{
    /// Reset stale in-flight steps and revive stale running instances.
    pub async fn check_heartbeat_health(&self) -> Result<HealthReport, EngineError> {
        let threshold = self.config().stale_threshold();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());

        let mut report = HealthReport::default();
        let mut touched = BTreeSet::new();

        for step in self.repo().list_stale_steps(cutoff).await? {
            let last_seen = step.heartbeat_at.unwrap_or(step.updated_at);
            let update = StepUpdate::new(
                StepStatus::Pending,
                format!(
                    "heartbeat stale since {}; reset after presumed worker crash",
                    last_seen.to_rfc3339()
                ),
            );
            if self.transition(&step, &[step.status], update).await? {
                self.heartbeats().forget(HeartbeatTarget::Step(step.id));
                tracing::warn!(
                    instance_id = %step.instance_id,
                    step_id = %step.id,
                    slot = %step.slot_key,
                    was = %step.status,
                    "stale step reset to pending"
                );
                report.steps_reset += 1;
                touched.insert(step.instance_id);
            }
        }

        for instance in self.repo().list_stale_instances(cutoff).await? {
            tracing::warn!(instance_id = %instance.id, "stale instance heartbeat, reviving");
            self.heartbeats()
                .start(HeartbeatTarget::Instance(instance.id))
                .await?;
            report.instances_revived += 1;
            touched.insert(instance.id);
        }

        for instance_id in touched {
            self.spawn_resume(instance_id, std::time::Duration::ZERO);
            report.rescheduled.push(instance_id);
        }

        if report.steps_reset > 0 || report.instances_revived > 0 {
            tracing::info!(
                steps_reset = report.steps_reset,
                instances_revived = report.instances_revived,
                "heartbeat health scan recovered work"
            );
        }
        Ok(report)
    }
}
