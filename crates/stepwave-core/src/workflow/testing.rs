//! In-memory test doubles for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use stepwave_types::config::EngineConfig;
use stepwave_types::error::RepositoryError;
use stepwave_types::lease::LeaseKey;
use stepwave_types::workflow::{
    InstanceSnapshot, InstanceStatus, RunMode, StepDefinition, StepEntry, StepKind, StepStatus,
    WaveSlot, WaveTable, WorkflowInstance, WorkflowTemplate, push_history,
};
use uuid::Uuid;

use super::engine::WorkflowEngine;
use super::evaluator::{EvalError, Evaluator, JexlEvaluator};
use super::lease::{LeaseError, LeaseStore};
use crate::event::EventBus;
use crate::repository::workflow::{StepUpdate, WorkflowRepository};

pub(crate) type TestEngine = WorkflowEngine<InMemoryStore, InMemoryLeases, ScriptedEvaluator>;

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    definitions: HashMap<String, StepDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<Uuid, StepEntry>,
}

#[derive(Default)]
pub(crate) struct InMemoryStore {
    state: Mutex<StoreState>,
    fail_heartbeats: AtomicBool,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make heartbeat touches fail until switched back off.
    pub(crate) fn fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn instance(&self, id: &Uuid) -> WorkflowInstance {
        self.state.lock().unwrap().instances[id].clone()
    }

    fn check_heartbeat_failure(&self) -> Result<(), RepositoryError> {
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query("heartbeat write refused".to_string()));
        }
        Ok(())
    }
}

impl WorkflowRepository for InMemoryStore {
    async fn save_definition(&self, def: &StepDefinition) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .unwrap()
            .definitions
            .insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<StepDefinition>, RepositoryError> {
        Ok(self.state.lock().unwrap().definitions.get(id).cloned())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.state.lock().unwrap().instances.get(id).cloned())
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut found: Vec<_> = state
            .instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }

    async fn finish_instance(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        message: &str,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if instance.status != InstanceStatus::Running {
            return Ok(false);
        }
        let now = Utc::now();
        instance.status = status;
        instance.heartbeat_active = false;
        push_history(&mut instance.status_history, status.as_str(), message, now);
        instance.updated_at = now;
        Ok(true)
    }

    async fn mark_instance_broken(&self, id: &Uuid, message: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        instance.workflow_broken = true;
        push_history(&mut instance.status_history, instance.status.as_str(), message, now);
        instance.updated_at = now;
        Ok(())
    }

    async fn update_skipped_orders(
        &self,
        id: &Uuid,
        add: &[u32],
        remove: &[u32],
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        instance.skipped_orders.extend(add.iter().copied());
        for order in remove {
            instance.skipped_orders.remove(order);
        }
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_instance_heartbeat(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.check_heartbeat_failure()?;
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !instance.heartbeat_active {
            return Ok(false);
        }
        instance.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn set_instance_heartbeat_active(
        &self,
        id: &Uuid,
        active: bool,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        instance.heartbeat_active = active;
        if active {
            instance.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_stale_instances(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .values()
            .filter(|i| {
                i.status == InstanceStatus::Running
                    && i.heartbeat_at.unwrap_or(i.updated_at) < cutoff
            })
            .cloned()
            .collect())
    }

    async fn insert_steps(&self, steps: &[StepEntry]) -> Result<usize, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let mut inserted = 0;
        for step in steps {
            let duplicate = state.steps.values().any(|s| {
                s.instance_id == step.instance_id
                    && s.order == step.order
                    && s.slot_key == step.slot_key
            });
            if !duplicate {
                state.steps.insert(step.id, step.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<StepEntry>, RepositoryError> {
        Ok(self.state.lock().unwrap().steps.get(id).cloned())
    }

    async fn list_steps(&self, instance_id: &Uuid) -> Result<Vec<StepEntry>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|s| &s.instance_id == instance_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| (a.order, &a.slot_key).cmp(&(b.order, &b.slot_key)));
        Ok(steps)
    }

    async fn transition_step(
        &self,
        id: &Uuid,
        from: &[StepStatus],
        update: &StepUpdate,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !from.contains(&step.status) {
            return Ok(false);
        }
        let now = Utc::now();
        step.status = update.status;
        push_history(
            &mut step.status_history,
            update.status.as_str(),
            update.message.clone(),
            now,
        );
        if let Some(output) = &update.output {
            step.output = Some(output.clone());
        }
        if let Some(error) = &update.error {
            step.error = Some(error.clone());
        }
        step.retry_at = update.retry_at;
        if update.increment_retry {
            step.retry_count += 1;
        }
        step.updated_at = now;
        Ok(true)
    }

    async fn touch_step_heartbeat(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.check_heartbeat_failure()?;
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !step.heartbeat_active {
            return Ok(false);
        }
        step.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn set_step_heartbeat_active(&self, id: &Uuid, active: bool) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(id).ok_or(RepositoryError::NotFound)?;
        step.heartbeat_active = active;
        if active {
            step.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_stale_steps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StepEntry>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .steps
            .values()
            .filter(|s| s.status.is_in_flight() && s.heartbeat_at.unwrap_or(s.updated_at) < cutoff)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct InMemoryLeases {
    held: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LeaseStore for InMemoryLeases {
    async fn acquire(&self, key: &LeaseKey, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let mut held = self.held.lock().unwrap();
        if let Some(expires_at) = held.get(&key.to_string()) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| LeaseError::Store(e.to_string()))?;
        held.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &LeaseKey) -> Result<(), LeaseError> {
        self.held.lock().unwrap().remove(&key.to_string());
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, LeaseError> {
        let now = Utc::now();
        let mut held = self.held.lock().unwrap();
        let before = held.len();
        held.retain(|_, expires_at| *expires_at > now);
        Ok((before - held.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with per-body scripted failures and delays.
#[derive(Default)]
pub(crate) struct ScriptedEvaluator {
    inner: JexlEvaluator,
    failures: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedEvaluator {
    /// Fail the next `times` evaluations of `body`.
    pub(crate) fn fail_body(&self, body: &str, times: u32) {
        self.failures.lock().unwrap().insert(body.to_string(), times);
    }

    /// Sleep before every evaluation of `body`.
    pub(crate) fn delay_body(&self, body: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(body.to_string(), delay);
    }
}

impl Evaluator for ScriptedEvaluator {
    fn run_body(
        &self,
        body: &str,
        context: &Value,
    ) -> impl Future<Output = Result<Value, EvalError>> + Send {
        let delay = self.delays.lock().unwrap().get(body).copied();
        let fail = match self.failures.lock().unwrap().get_mut(body) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let result = if fail {
            Err(EvalError::EvalFailed(format!("scripted failure for '{body}'")))
        } else {
            self.inner.evaluate_value(body, context)
        };
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }

    fn eval_condition(
        &self,
        condition: &str,
        context: &Value,
    ) -> impl Future<Output = Result<bool, EvalError>> + Send {
        self.inner.eval_condition(condition, context)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        heartbeat_interval_ms: 50,
        stale_threshold_ms: 30_000,
        heartbeat_failure_limit: 3,
        max_retries: 3,
        retry_base_delay_ms: 10,
        lease_ttl_ms: 5_000,
        recovery_jitter_ms: 0,
        step_timeout_ms: 5_000,
        status_poll_ms: 50,
        health_scan_interval_ms: 0,
    }
}

pub(crate) fn test_engine() -> TestEngine {
    test_engine_with(test_config())
}

pub(crate) fn test_engine_with(config: EngineConfig) -> TestEngine {
    WorkflowEngine::new(
        InMemoryStore::new(),
        InMemoryLeases::default(),
        ScriptedEvaluator::default(),
        EventBus::new(256),
        config,
    )
}

pub(crate) fn function_def(id: &str, body: &str) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.to_string(),
        kind: StepKind::Function {
            body: body.to_string(),
        },
        inputs: vec![],
        outputs: vec![],
        run_mode: RunMode::RW,
        internal_json: Map::new(),
    }
}

pub(crate) fn control_def(id: &str, expression: &str) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.to_string(),
        kind: StepKind::Control {
            expression: expression.to_string(),
        },
        inputs: vec![],
        outputs: vec![],
        run_mode: RunMode::RW,
        internal_json: Map::new(),
    }
}

pub(crate) fn slot(definition_id: &str) -> WaveSlot {
    WaveSlot::new(definition_id)
}

pub(crate) fn template(waves: Vec<(u32, Vec<(&str, WaveSlot)>)>) -> WorkflowTemplate {
    let mut table = WaveTable::new();
    for (order, slots) in waves {
        let slots: BTreeMap<String, WaveSlot> = slots
            .into_iter()
            .map(|(key, slot)| (key.to_string(), slot))
            .collect();
        table.insert(order, slots);
    }
    WorkflowTemplate {
        id: "tpl-test".to_string(),
        name: "test template".to_string(),
        internal_json: Map::new(),
        waves: table,
    }
}

/// Persist a bare running instance without starting any engine work.
pub(crate) async fn seeded_instance(store: &InMemoryStore) -> WorkflowInstance {
    let tpl = template(vec![(1, vec![("a", slot("noop"))])]);
    let instance = WorkflowInstance::from_template(&tpl, Map::new());
    store.create_instance(&instance).await.unwrap();
    instance
}

/// Poll until the instance leaves `running`, or panic after 10 seconds.
pub(crate) async fn wait_for_terminal(engine: &TestEngine, id: Uuid) -> InstanceSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = engine.get_instance_status(&id).await.unwrap();
        if snapshot.instance.status.is_terminal() {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("instance {id} still running: {snapshot:#?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
