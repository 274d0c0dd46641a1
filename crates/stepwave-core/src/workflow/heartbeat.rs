//! Periodic liveness writes for instances and steps.
//!
//! Each live instance and each in-flight step owns a timer that refreshes
//! its `heartbeat_at`. The timer stops itself when the persisted
//! `heartbeat_active` flag has been cleared, or after too many consecutive
//! write failures. `HeartbeatRegistry::shutdown` cancels every timer
//! without touching persisted state, so a restarted process sees the
//! heartbeats go stale and recovers the work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;
use stepwave_types::error::RepositoryError;

/// What a heartbeat timer keeps alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatTarget {
    Instance(Uuid),
    Step(Uuid),
}

impl std::fmt::Display for HeartbeatTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatTarget::Instance(id) => write!(f, "instance {id}"),
            HeartbeatTarget::Step(id) => write!(f, "step {id}"),
        }
    }
}

struct TimerHandle {
    generation: u64,
    token: CancellationToken,
}

/// Owns every heartbeat timer in this process.
pub struct HeartbeatRegistry<R> {
    repo: Arc<R>,
    interval: Duration,
    failure_limit: u32,
    timers: Arc<DashMap<HeartbeatTarget, TimerHandle>>,
    next_generation: AtomicU64,
}

impl<R: WorkflowRepository + 'static> HeartbeatRegistry<R> {
    pub fn new(repo: Arc<R>, interval: Duration, failure_limit: u32) -> Self {
        Self {
            repo,
            interval,
            failure_limit: failure_limit.max(1),
            timers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Mark the target active and start its timer.
    ///
    /// Starting a target that already has a timer restarts it.
    pub async fn start(&self, target: HeartbeatTarget) -> Result<(), RepositoryError> {
        set_active(self.repo.as_ref(), target, true).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some(previous) = self.timers.insert(
            target,
            TimerHandle {
                generation,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let repo = Arc::clone(&self.repo);
        let timers = Arc::clone(&self.timers);
        let interval = self.interval;
        let failure_limit = self.failure_limit;

        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match touch(repo.as_ref(), target).await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        tracing::debug!(%target, "heartbeat deactivated, stopping timer");
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            %target,
                            failures,
                            error = %e,
                            "heartbeat write failed"
                        );
                        if failures >= failure_limit {
                            tracing::error!(
                                %target,
                                "heartbeat failure limit reached, stopping timer"
                            );
                            if let Err(e) = set_active(repo.as_ref(), target, false).await {
                                tracing::warn!(%target, error = %e, "failed to clear heartbeat flag");
                            }
                            break;
                        }
                    }
                }
            }
            timers.remove_if(&target, |_, handle| handle.generation == generation);
        });

        Ok(())
    }

    /// Cancel the target's timer and clear its persisted flag.
    pub async fn stop(&self, target: HeartbeatTarget) {
        self.forget(target);
        if let Err(e) = set_active(self.repo.as_ref(), target, false).await {
            tracing::warn!(%target, error = %e, "failed to clear heartbeat flag");
        }
    }

    /// Cancel the target's timer, leaving persisted state untouched.
    pub fn forget(&self, target: HeartbeatTarget) {
        if let Some((_, handle)) = self.timers.remove(&target) {
            handle.token.cancel();
        }
    }

    /// Cancel every timer, leaving persisted state untouched.
    pub fn shutdown(&self) {
        let count = self.timers.len();
        for entry in self.timers.iter() {
            entry.value().token.cancel();
        }
        self.timers.clear();
        tracing::info!(count, "heartbeat timers stopped");
    }

    pub fn is_running(&self, target: HeartbeatTarget) -> bool {
        self.timers.contains_key(&target)
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

async fn touch<R: WorkflowRepository>(
    repo: &R,
    target: HeartbeatTarget,
) -> Result<bool, RepositoryError> {
    match target {
        HeartbeatTarget::Instance(id) => repo.touch_instance_heartbeat(&id).await,
        HeartbeatTarget::Step(id) => repo.touch_step_heartbeat(&id).await,
    }
}

async fn set_active<R: WorkflowRepository>(
    repo: &R,
    target: HeartbeatTarget,
    active: bool,
) -> Result<(), RepositoryError> {
    match target {
        HeartbeatTarget::Instance(id) => repo.set_instance_heartbeat_active(&id, active).await,
        HeartbeatTarget::Step(id) => repo.set_step_heartbeat_active(&id, active).await,
    }
}
