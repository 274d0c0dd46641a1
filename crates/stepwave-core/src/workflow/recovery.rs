//! Startup recovery of running instances.
//!
//! After a restart nothing in memory survives, so every `running` instance
//! is re-adopted: expired leases are purged, steps caught mid-flight are
//! reset to `pending`, retries whose timers died with the old process are
//! re-queued, and each instance resumes after a random jitter so a fleet of
//! restarting processes does not stampede the store.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use stepwave_types::workflow::{InstanceStatus, StepStatus};
use uuid::Uuid;

use super::engine::{EngineError, WorkflowEngine};
use super::evaluator::Evaluator;
use super::heartbeat::HeartbeatTarget;
use super::lease::LeaseStore;
use crate::repository::workflow::{StepUpdate, WorkflowRepository};

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub leases_purged: u64,
    pub instances: usize,
    /// In-flight steps reset to `pending`.
    pub steps_reset: usize,
    /// Failed steps with a pending retry re-queued immediately.
    pub retries_requeued: usize,
}

impl<R, L, E> WorkflowEngine<R, L, E>
where
    R: WorkflowRepository + 'static,
    L: LeaseStore + 'static,
    E: Evaluator + 'static,
{
    /// Re-adopt every running instance after a restart.
    ///
    /// Safe to call repeatedly: instances with no mid-flight steps keep
    /// their step state untouched.
    pub async fn recover_running_instances(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport {
            leases_purged: self.leases().purge_expired().await?,
            ..Default::default()
        };

        let running = self
            .repo()
            .list_instances_by_status(InstanceStatus::Running)
            .await?;

        for instance in running {
            report.instances += 1;
            self.heartbeats()
                .start(HeartbeatTarget::Instance(instance.id))
                .await?;

            for step in self.repo().list_steps(&instance.id).await? {
                if step.status.is_in_flight() {
                    let update = StepUpdate::new(
                        StepStatus::Pending,
                        format!("reset on recovery (was {})", step.status),
                    );
                    if self.transition(&step, &[step.status], update).await? {
                        report.steps_reset += 1;
                    }
                } else if step.status == StepStatus::Failed && step.retry_at.is_some() {
                    let update =
                        StepUpdate::new(StepStatus::Pending, "retry re-queued on recovery")
                            .incrementing_retry();
                    if self.transition(&step, &[StepStatus::Failed], update).await? {
                        report.retries_requeued += 1;
                    }
                }
            }

            self.spawn_resume(instance.id, self.recovery_jitter());
        }

        tracing::info!(
            instances = report.instances,
            steps_reset = report.steps_reset,
            retries_requeued = report.retries_requeued,
            leases_purged = report.leases_purged,
            "recovery complete"
        );
        Ok(report)
    }

    fn recovery_jitter(&self) -> Duration {
        let max = self.config().recovery_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    /// Resume an instance on a background task after `delay`.
    pub(crate) fn spawn_resume(&self, instance_id: Uuid, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = engine.resume_instance(instance_id).await {
                tracing::error!(%instance_id, error = %e, "failed to resume instance");
            }
        });
    }

    /// Pick an instance back up from whatever its persisted state says.
    ///
    /// Live steps go to the scheduler. If every existing step has settled
    /// the instance stopped between waves, so the wave after the last one
    /// is materialized (or the instance finalized).
    async fn resume_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let instance = self.load_instance(&instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        let steps = self.repo().list_steps(&instance_id).await?;
        if steps.iter().any(|s| !s.is_terminal()) {
            self.spawn_scheduler(instance_id);
            return Ok(());
        }

        match steps.iter().map(|s| s.order).max() {
            Some(last) => self.advance_after(instance_id, last).await,
            None => match instance.first_order() {
                Some(first) => {
                    self.materialize_wave(instance_id, first).await?;
                    self.spawn_scheduler(instance_id);
                    Ok(())
                }
                None => {
                    self.check_completion(instance_id).await?;
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{
        function_def, slot, template, test_config, test_engine, test_engine_with,
        wait_for_terminal,
    };
    use chrono::Utc;
    use stepwave_types::workflow::{RunMode, StepEntry, WorkflowInstance};

    #[tokio::test]
    async fn test_recovery_resets_in_flight_and_finishes() {
        let engine = test_engine();
        engine
            .register_definition(&function_def("noop", "1"))
            .await
            .unwrap();
        let tpl = template(vec![
            (1, vec![("a", slot("noop")), ("b", slot("noop"))]),
            (2, vec![("c", slot("noop"))]),
        ]);

        let instance = WorkflowInstance::from_template(&tpl, Default::default());
        engine.repository().create_instance(&instance).await.unwrap();
        let mut a = StepEntry::pending(instance.id, 1, "a", "noop", RunMode::RW);
        a.status = StepStatus::Completed;
        let mut b = StepEntry::pending(instance.id, 1, "b", "noop", RunMode::RW);
        b.status = StepStatus::Executing;
        engine.repository().insert_steps(&[a, b.clone()]).await.unwrap();

        let report = engine.recover_running_instances().await.unwrap();
        assert_eq!(report.instances, 1);
        assert_eq!(report.steps_reset, 1);

        let snapshot = wait_for_terminal(&engine, instance.id).await;
        assert_eq!(snapshot.instance.status, InstanceStatus::Completed);
        assert_eq!(snapshot.steps.len(), 3);
        let b = snapshot.steps.iter().find(|s| s.id == b.id).unwrap();
        assert!(b.status_history.iter().any(|h| h.message.contains("reset on recovery")));
    }

    #[tokio::test]
    async fn test_recovery_requeues_orphaned_retry() {
        let engine = test_engine();
        engine
            .register_definition(&function_def("noop", "1"))
            .await
            .unwrap();
        let tpl = template(vec![(1, vec![("a", slot("noop"))])]);

        let instance = WorkflowInstance::from_template(&tpl, Default::default());
        engine.repository().create_instance(&instance).await.unwrap();
        let mut a = StepEntry::pending(instance.id, 1, "a", "noop", RunMode::RW);
        a.status = StepStatus::Failed;
        a.retry_at = Some(Utc::now());
        a.error = Some("boom".to_string());
        engine.repository().insert_steps(&[a]).await.unwrap();

        let report = engine.recover_running_instances().await.unwrap();
        assert_eq!(report.retries_requeued, 1);

        let snapshot = wait_for_terminal(&engine, instance.id).await;
        assert_eq!(snapshot.instance.status, InstanceStatus::Completed);
        assert_eq!(snapshot.steps[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_recovery_stalled_between_waves_advances() {
        let engine = test_engine();
        engine
            .register_definition(&function_def("noop", "1"))
            .await
            .unwrap();
        let tpl = template(vec![
            (1, vec![("a", slot("noop"))]),
            (2, vec![("b", slot("noop"))]),
        ]);

        let instance = WorkflowInstance::from_template(&tpl, Default::default());
        engine.repository().create_instance(&instance).await.unwrap();
        let mut a = StepEntry::pending(instance.id, 1, "a", "noop", RunMode::RW);
        a.status = StepStatus::Completed;
        engine.repository().insert_steps(&[a]).await.unwrap();

        engine.recover_running_instances().await.unwrap();
        let snapshot = wait_for_terminal(&engine, instance.id).await;

        assert_eq!(snapshot.instance.status, InstanceStatus::Completed);
        assert!(snapshot.steps.iter().any(|s| s.slot_key == "b"));
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent_without_mid_flight_steps() {
        let mut config = test_config();
        config.recovery_jitter_ms = 60_000;
        let engine = test_engine_with(config);
        let tpl = template(vec![(1, vec![("a", slot("noop")), ("b", slot("noop"))])]);

        let instance = WorkflowInstance::from_template(&tpl, Default::default());
        engine.repository().create_instance(&instance).await.unwrap();
        let mut a = StepEntry::pending(instance.id, 1, "a", "noop", RunMode::RW);
        a.status = StepStatus::Completed;
        let b = StepEntry::pending(instance.id, 1, "b", "noop", RunMode::RW);
        engine.repository().insert_steps(&[a, b]).await.unwrap();

        let before = engine.repository().list_steps(&instance.id).await.unwrap();
        for _ in 0..2 {
            let report = engine.recover_running_instances().await.unwrap();
            assert_eq!(report.steps_reset, 0);
            assert_eq!(report.retries_requeued, 0);
        }
        let after = engine.repository().list_steps(&instance.id).await.unwrap();

        for (x, y) in before.iter().zip(after.iter()) {
            assert_eq!(x.status, y.status);
            assert_eq!(x.status_history.len(), y.status_history.len());
        }
        engine.graceful_shutdown();
    }

    #[tokio::test]
    async fn test_recovery_skips_finished_instances() {
        let engine = test_engine();
        let tpl = template(vec![(1, vec![("a", slot("noop"))])]);
        let instance = WorkflowInstance::from_template(&tpl, Default::default());
        engine.repository().create_instance(&instance).await.unwrap();
        engine
            .repository()
            .finish_instance(&instance.id, InstanceStatus::Completed, "done")
            .await
            .unwrap();

        let report = engine.recover_running_instances().await.unwrap();
        assert_eq!(report.instances, 0);
    }
}
