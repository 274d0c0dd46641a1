//! Wave scheduling and control-flow dispatch.
//!
//! A wave is materialized lazily: its step entries are inserted only when
//! the previous wave lets it advance. After every step settles the
//! scheduler decides what happens next:
//!
//! - `proceed` in `R` mode advances immediately; in `RW` mode the wave
//!   advances once no sibling is live (serialized by a completion lease).
//! - `continue` jumps to a target slot, skipping everything in between.
//! - `break` stops materialization and finalizes once in-flight work drains.
//! - `wait` advances only once every earlier step has settled.

use stepwave_types::event::EngineEvent;
use stepwave_types::lease::LeaseKey;
use stepwave_types::workflow::{
    ControlDecision, FlowAction, InstanceStatus, RunMode, StepEntry, StepStatus,
};
use uuid::Uuid;

use super::engine::{EngineError, WorkflowEngine};
use super::evaluator::Evaluator;
use super::heartbeat::HeartbeatTarget;
use super::lease::LeaseStore;
use crate::repository::workflow::{StepUpdate, WorkflowRepository};

/// Conditional skip attempts before giving up on a racing step.
const SKIP_ATTEMPTS: usize = 3;

/// Statuses `break` may skip; executing and finalizing steps drain.
const BREAK_SKIPPABLE: [StepStatus; 3] = [
    StepStatus::Pending,
    StepStatus::Initializing,
    StepStatus::Failed,
];

/// Result of asking for a wave's step entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaveInsert {
    /// Entries were inserted by this call.
    Inserted(usize),
    /// Entries already existed; `live` if any is still non-terminal.
    Existing { live: bool },
    /// The instance is broken, finished, or jumped over this wave.
    Declined,
    /// Another actor holds the insertion lease.
    Busy,
}

impl<R, L, E> WorkflowEngine<R, L, E>
where
    R: WorkflowRepository + 'static,
    L: LeaseStore + 'static,
    E: Evaluator + 'static,
{
    /// Launch pending steps of the instance's lowest active wave.
    pub(crate) fn spawn_scheduler(&self, instance_id: Uuid) {
        if self.is_shutting_down() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.schedule(instance_id).await {
                tracing::error!(%instance_id, error = %e, "scheduling failed");
            }
        });
    }

    async fn schedule(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let instance = self.load_instance(&instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        if instance.workflow_broken {
            return self.drain_broken(instance_id, "skipped after break").await;
        }

        let steps = self.repo().list_steps(&instance_id).await?;
        let Some(order) = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Initializing))
            .map(|s| s.order)
            .min()
        else {
            return Ok(());
        };

        let ready: Vec<StepEntry> = steps
            .into_iter()
            .filter(|s| s.order == order && s.status == StepStatus::Pending)
            .collect();
        tracing::debug!(%instance_id, order, ready = ready.len(), "scheduling wave");
        for step in ready {
            self.spawn_step(step);
        }
        Ok(())
    }

    /// Dispatch on a completed step's decision.
    pub(crate) async fn on_step_settled(
        &self,
        step: &StepEntry,
        decision: &ControlDecision,
    ) -> Result<(), EngineError> {
        match decision.action {
            FlowAction::Proceed => match step.run_mode {
                RunMode::R => self.advance_after(step.instance_id, step.order).await,
                RunMode::RW => self.complete_wave(step.instance_id, step.order).await,
            },
            FlowAction::Continue => match decision.target_step.as_deref() {
                Some(target) => self.handle_continue(step, target).await,
                None => self.complete_wave(step.instance_id, step.order).await,
            },
            FlowAction::Break => self.handle_break(step).await,
            FlowAction::Wait => self.handle_wait(step).await,
        }
    }

    /// Advance past `order` once none of its steps is live.
    ///
    /// A holder that sees live siblings re-reads after releasing the lease,
    /// so a sibling that settled while the lease was held (and backed off)
    /// is never stranded.
    pub(crate) async fn complete_wave(&self, instance_id: Uuid, order: u32) -> Result<(), EngineError> {
        let key = LeaseKey::completion(instance_id, order);
        loop {
            if !self.leases().acquire(&key, self.config().lease_ttl()).await? {
                tracing::debug!(%instance_id, order, "wave completion decided elsewhere");
                return Ok(());
            }

            let decided = self.decide_wave(instance_id, order).await;
            self.release_lease(&key).await;

            if decided? {
                return Ok(());
            }
            if self.live_steps_in_wave(instance_id, order).await? > 0 {
                return Ok(());
            }
        }
    }

    async fn decide_wave(&self, instance_id: Uuid, order: u32) -> Result<bool, EngineError> {
        let live = self.live_steps_in_wave(instance_id, order).await?;
        if live > 0 {
            tracing::debug!(%instance_id, order, live, "wave still has live steps");
            return Ok(false);
        }
        tracing::debug!(%instance_id, order, "wave complete");
        self.advance_after(instance_id, order).await?;
        Ok(true)
    }

    async fn live_steps_in_wave(&self, instance_id: Uuid, order: u32) -> Result<usize, EngineError> {
        Ok(self
            .repo()
            .list_steps(&instance_id)
            .await?
            .iter()
            .filter(|s| s.order == order && !s.is_terminal())
            .count())
    }

    /// Move to the first wave after `order` that still has work, or finish.
    ///
    /// Waves that already exist with every step settled (for example after
    /// a backward `continue`) are walked past.
    pub(crate) async fn advance_after(&self, instance_id: Uuid, order: u32) -> Result<(), EngineError> {
        let mut from = order;
        loop {
            let instance = self.load_instance(&instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(());
            }
            if instance.workflow_broken {
                self.check_completion(instance_id).await?;
                return Ok(());
            }
            let Some(next) = instance.next_order_after(from) else {
                self.check_completion(instance_id).await?;
                return Ok(());
            };

            match self.materialize_wave(instance_id, next).await? {
                WaveInsert::Inserted(_) | WaveInsert::Existing { live: true } => {
                    self.spawn_scheduler(instance_id);
                    return Ok(());
                }
                WaveInsert::Existing { live: false } => from = next,
                WaveInsert::Declined => {
                    self.check_completion(instance_id).await?;
                    return Ok(());
                }
                WaveInsert::Busy => return Ok(()),
            }
        }
    }

    /// Insert a wave's step entries under the insertion lease.
    ///
    /// Idempotent: a wave that already has entries is left alone.
    pub(crate) async fn materialize_wave(
        &self,
        instance_id: Uuid,
        order: u32,
    ) -> Result<WaveInsert, EngineError> {
        let key = LeaseKey::insertion(instance_id, order);
        if !self.leases().acquire(&key, self.config().lease_ttl()).await? {
            tracing::debug!(%instance_id, order, "wave insertion in progress elsewhere");
            return Ok(WaveInsert::Busy);
        }
        let result = self.insert_wave(instance_id, order).await;
        self.release_lease(&key).await;
        result
    }

    async fn insert_wave(&self, instance_id: Uuid, order: u32) -> Result<WaveInsert, EngineError> {
        let instance = self.load_instance(&instance_id).await?;
        if instance.status.is_terminal()
            || instance.workflow_broken
            || instance.skipped_orders.contains(&order)
        {
            tracing::debug!(%instance_id, order, "wave insertion declined");
            return Ok(WaveInsert::Declined);
        }

        let existing: Vec<StepEntry> = self
            .repo()
            .list_steps(&instance_id)
            .await?
            .into_iter()
            .filter(|s| s.order == order)
            .collect();
        if !existing.is_empty() {
            return Ok(WaveInsert::Existing {
                live: existing.iter().any(|s| !s.is_terminal()),
            });
        }

        let Some(slots) = instance.waves.get(&order) else {
            return Ok(WaveInsert::Declined);
        };

        let mut entries = Vec::with_capacity(slots.len());
        for (slot_key, slot) in slots {
            let run_mode = match self.repo().get_definition(&slot.definition_id).await? {
                Some(def) => def.run_mode,
                None => {
                    tracing::warn!(
                        %instance_id,
                        slot = %slot_key,
                        definition_id = %slot.definition_id,
                        "step definition missing at materialization"
                    );
                    RunMode::default()
                }
            };
            entries.push(StepEntry::pending(
                instance_id,
                order,
                slot_key.clone(),
                slot.definition_id.clone(),
                run_mode,
            ));
        }

        let inserted = self.repo().insert_steps(&entries).await?;
        if inserted == 0 {
            return Ok(WaveInsert::Existing { live: false });
        }

        tracing::info!(%instance_id, order, steps = inserted, "wave materialized");
        self.events().publish(EngineEvent::WaveMaterialized {
            instance_id,
            order,
            steps: inserted,
        });
        Ok(WaveInsert::Inserted(inserted))
    }

    async fn handle_continue(&self, step: &StepEntry, target: &str) -> Result<(), EngineError> {
        let instance = self.load_instance(&step.instance_id).await?;
        let Some(target_order) = instance.order_of_slot(target) else {
            tracing::warn!(
                instance_id = %instance.id,
                target,
                "continue target vanished, treating as proceed"
            );
            return self.complete_wave(step.instance_id, step.order).await;
        };
        let current = step.order;
        let message = format!("skipped by continue from '{}' to '{target}'", step.slot_key);

        tracing::info!(
            instance_id = %instance.id,
            from = %step.slot_key,
            target,
            current,
            target_order,
            "continue"
        );

        let jumped: Vec<u32> = if target_order > current {
            instance
                .waves
                .range(current + 1..target_order)
                .map(|(o, _)| *o)
                .collect()
        } else {
            Vec::new()
        };

        if target_order >= current {
            if target_order > current {
                self.repo()
                    .update_skipped_orders(&instance.id, &jumped, &[target_order])
                    .await?;
            }
            let steps = self.repo().list_steps(&instance.id).await?;
            for sibling in steps.iter().filter(|s| {
                s.id != step.id
                    && (s.order == current || jumped.contains(&s.order))
                    && !(s.order == target_order && s.slot_key == target)
            }) {
                self.skip_step(sibling, &StepStatus::SKIPPABLE, &message).await?;
            }
        }

        if self.materialize_wave(instance.id, target_order).await? == WaveInsert::Declined {
            self.check_completion(instance.id).await?;
            return Ok(());
        }

        let steps = self.repo().list_steps(&instance.id).await?;
        if let Some(entry) = steps
            .iter()
            .find(|s| s.order == target_order && s.slot_key == target)
        {
            if entry.is_terminal() {
                self.transition(
                    entry,
                    &[entry.status],
                    StepUpdate::new(
                        StepStatus::Pending,
                        format!("re-queued by continue from '{}'", step.slot_key),
                    ),
                )
                .await?;
            }
        }

        self.spawn_scheduler(instance.id);
        Ok(())
    }

    async fn handle_break(&self, step: &StepEntry) -> Result<(), EngineError> {
        let instance_id = step.instance_id;
        self.repo()
            .mark_instance_broken(&instance_id, &format!("break requested by '{}'", step.slot_key))
            .await?;
        tracing::info!(%instance_id, slot = %step.slot_key, order = step.order, "break");

        let message = format!("skipped by break from '{}'", step.slot_key);
        self.drain_broken(instance_id, &message).await
    }

    /// Skip every remaining step of a broken instance that has not started
    /// running, in any wave, then finalize if nothing is left in flight.
    ///
    /// Earlier waves are included: an `R` step may have let the break wave
    /// materialize while a sibling was still waiting on a retry.
    pub(crate) async fn drain_broken(&self, instance_id: Uuid, message: &str) -> Result<(), EngineError> {
        let steps = self.repo().list_steps(&instance_id).await?;
        for other in &steps {
            self.skip_step(other, &BREAK_SKIPPABLE, message).await?;
        }
        self.check_completion(instance_id).await?;
        Ok(())
    }

    async fn handle_wait(&self, step: &StepEntry) -> Result<(), EngineError> {
        let outstanding = self
            .repo()
            .list_steps(&step.instance_id)
            .await?
            .iter()
            .filter(|s| s.id != step.id && s.order <= step.order && !s.is_terminal())
            .count();

        if outstanding > 0 {
            tracing::debug!(
                instance_id = %step.instance_id,
                slot = %step.slot_key,
                outstanding,
                "wait: earlier steps still live"
            );
            return Ok(());
        }
        self.advance_after(step.instance_id, step.order).await
    }

    /// Conditionally skip a live step whose status is in `allowed`.
    async fn skip_step(
        &self,
        step: &StepEntry,
        allowed: &[StepStatus],
        message: &str,
    ) -> Result<bool, EngineError> {
        let mut current = step.clone();
        for _ in 0..SKIP_ATTEMPTS {
            if current.is_terminal() || !allowed.contains(&current.status) {
                return Ok(false);
            }
            let update = StepUpdate::new(StepStatus::Skipped, message);
            if self.transition(&current, &[current.status], update).await? {
                return Ok(true);
            }
            match self.repo().get_step(&current.id).await? {
                Some(fresh) => current = fresh,
                None => return Ok(false),
            }
        }
        tracing::warn!(step_id = %step.id, "gave up skipping a contended step");
        Ok(false)
    }

    /// Finalize the instance if no step is live.
    pub(crate) async fn check_completion(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let instance = self.load_instance(&instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        let steps = self.repo().list_steps(&instance_id).await?;
        if steps.iter().any(|s| !s.is_terminal()) {
            return Ok(false);
        }

        let (status, message) = if instance.workflow_broken {
            (
                InstanceStatus::CompletedWithBreak,
                "finished after break".to_string(),
            )
        } else if let Some(failed) = steps.iter().find(|s| s.is_permanently_failed()) {
            (
                InstanceStatus::Failed,
                format!("step '{}' failed permanently", failed.slot_key),
            )
        } else {
            (InstanceStatus::Completed, "all waves finished".to_string())
        };

        if !self
            .repo()
            .finish_instance(&instance_id, status, &message)
            .await?
        {
            return Ok(false);
        }

        self.heartbeats().forget(HeartbeatTarget::Instance(instance_id));
        tracing::info!(%instance_id, %status, "workflow instance finished");
        self.events()
            .publish(EngineEvent::InstanceFinished { instance_id, status });
        Ok(true)
    }

    async fn release_lease(&self, key: &LeaseKey) {
        if let Err(e) = self.leases().release(key).await {
            tracing::warn!(lease = %key, error = %e, "failed to release lease");
        }
    }
}
