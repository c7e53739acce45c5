// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Orchestrator
//!
//! Façade over the registry, queue, router, consensus coordinator and
//! resource ledger. It owns the operations that span more than one of them
//! and keeps the cross-entity invariant intact:
//!
//! > an agent is `Busy` with task T ⇔ T is `Assigned` or `Running` on that agent
//!
//! Every two-step mutation changes the agent first (under its record lock)
//! and rolls that change back if the queue side fails.
//!
//! Locking order, outermost first: agent record (async) → causal buffer →
//! queue / router / consensus slot / lock entry (`parking_lot`, never held
//! across `.await`).

use crate::application::causal::{CausalDelivery, CausalUpdate, SwarmUpdate};
use crate::application::consensus::{ConsensusCoordinator, ProposalDraft};
use crate::application::heartbeat::HeartbeatMonitor;
use crate::application::ledger::{DeadlockResolution, ResourceLedger};
use crate::application::registry::{AgentFilter, AgentRegistry, RegistrySettings};
use crate::application::router::{ReconfigureReport, TopologyRouter};
use crate::application::scheduler::{Cancellation, CancelOutcome, FailOutcome, Settlement, TaskQueue};
use crate::application::snapshot::SnapshotWriter;
use crate::domain::proposal::{AbortReason, Proposal, ProposalOutcome};
use crate::domain::swarm::{Swarm, SwarmStatus};
use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::{Agent, AgentEvent, AgentId, AgentProfile, AgentState, TransitionError};
use aegis_core::domain::events::{AgentLifecycleEvent, SwarmEvent, TaskEvent};
use aegis_core::domain::hooks::TransitionHook;
use aegis_core::domain::repository::{EntityKind, StateStore};
use aegis_core::domain::runtime::AgentRuntime;
use aegis_core::domain::swarm::{ProposalId, SwarmId, Topology};
use aegis_core::domain::swarm_config::SwarmConfig;
use aegis_core::domain::task::{Task, TaskId, TaskSpec, TaskState};
use aegis_core::infrastructure::event_bus::{EventBus, EventReceiver};
use aegis_core::infrastructure::runtime::InProcessRuntime;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Agents whose heartbeat deadline passed
    pub expired_agents: Vec<AgentId>,
    /// Subset of `expired_agents` brought back by auto-restart
    pub restarted_agents: Vec<AgentId>,
    pub deadlocks_resolved: usize,
    pub expired_proposals: Vec<ProposalId>,
    pub collected_proposals: usize,
    /// Set when this pass halted the swarm
    pub halted: Option<String>,
}

pub struct SwarmOrchestratorBuilder {
    config: SwarmConfig,
    runtime: Option<Arc<dyn AgentRuntime>>,
    hooks: Vec<Arc<dyn TransitionHook>>,
    store: Option<Arc<dyn StateStore>>,
    event_bus: Option<EventBus>,
}

impl SwarmOrchestratorBuilder {
    pub fn new(config: SwarmConfig) -> Self {
        Self {
            config,
            runtime: None,
            hooks: Vec::new(),
            store: None,
            event_bus: None,
        }
    }

    /// Provisioner for agent instances; defaults to [`InProcessRuntime`].
    pub fn runtime(mut self, runtime: Arc<dyn AgentRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Register a transition hook. Hooks run in registration order.
    pub fn hook(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// Must be called inside a tokio runtime when hooks are registered.
    pub fn build(self) -> SwarmResult<SwarmOrchestrator> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| SwarmError::InvalidConfig(e.to_string()))?;

        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(config.event_bus_capacity));
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(InProcessRuntime::default()));

        let swarm = Swarm::from_config(&config);
        let swarm_id = swarm.id;
        let router = TopologyRouter::new(swarm)?;
        let registry = AgentRegistry::new(
            RegistrySettings {
                max_agents: config.max_agents,
                max_restarts: config.max_agent_restarts,
                spawn_retry: config.spawn_retry.clone(),
            },
            runtime,
            self.hooks,
            event_bus.clone(),
        );

        info!(
            swarm = %config.name,
            swarm_id = %swarm_id,
            topology = %config.topology,
            max_agents = config.max_agents,
            queue_capacity = config.queue_capacity,
            "Swarm orchestrator initialized"
        );

        Ok(SwarmOrchestrator {
            inner: Arc::new(Inner {
                swarm_id,
                registry,
                queue: TaskQueue::new(config.queue_capacity, config.max_task_retries),
                router,
                consensus: ConsensusCoordinator::new(config.proposal_timeout, event_bus.clone()),
                causal: Mutex::new(CausalDelivery::new()),
                ledger: ResourceLedger::new(event_bus.clone()),
                heartbeats: Mutex::new(HeartbeatMonitor::new(config.heartbeat_timeout)),
                snapshots: SnapshotWriter::new(self.store),
                event_bus,
                halted: RwLock::new(None),
                cancel_timers: Mutex::new(HashMap::new()),
                maintenance: Mutex::new(None),
                config,
            }),
        })
    }
}

struct Inner {
    config: SwarmConfig,
    swarm_id: SwarmId,
    registry: AgentRegistry,
    queue: TaskQueue,
    router: TopologyRouter,
    consensus: ConsensusCoordinator,
    causal: Mutex<CausalDelivery<SwarmUpdate>>,
    ledger: ResourceLedger,
    heartbeats: Mutex<HeartbeatMonitor>,
    snapshots: SnapshotWriter,
    event_bus: EventBus,
    halted: RwLock<Option<String>>,
    /// Grace timers for tasks with an outstanding cancellation request
    cancel_timers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    maintenance: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((token, _)) = self.maintenance.get_mut().take() {
            token.cancel();
        }
        for (_, timer) in self.cancel_timers.get_mut().drain() {
            timer.abort();
        }
    }
}

/// Cheaply cloneable handle to one swarm.
#[derive(Clone)]
pub struct SwarmOrchestrator {
    inner: Arc<Inner>,
}

impl SwarmOrchestrator {
    pub fn builder(config: SwarmConfig) -> SwarmOrchestratorBuilder {
        SwarmOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn swarm_id(&self) -> SwarmId {
        self.inner.swarm_id
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    // ── Health ────────────────────────────────────────────────────────────

    fn ensure_running(&self) -> SwarmResult<()> {
        match self.inner.halted.read().as_ref() {
            Some(reason) => Err(SwarmError::SwarmHalted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.read().is_some()
    }

    /// Refuse every mutating call until [`Self::reset`].
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut halted = self.inner.halted.write();
            if halted.is_some() {
                return;
            }
            *halted = Some(reason.clone());
        }
        error!(swarm_id = %self.inner.swarm_id, "Swarm halted: {}", reason);
        metrics::gauge!("aegis_swarm_halted").set(1.0);
        self.inner.event_bus.publish_swarm_event(SwarmEvent::SwarmHalted {
            swarm_id: self.inner.swarm_id,
            reason,
            halted_at: Utc::now(),
        });
    }

    /// Clear a halt and drop every resource lock.
    pub fn reset(&self) {
        self.inner.ledger.reset();
        *self.inner.halted.write() = None;
        info!(swarm_id = %self.inner.swarm_id, "Swarm reset");
        metrics::gauge!("aegis_swarm_halted").set(0.0);
        self.inner.event_bus.publish_swarm_event(SwarmEvent::SwarmReset {
            swarm_id: self.inner.swarm_id,
            reset_at: Utc::now(),
        });
    }

    // ── Agents ────────────────────────────────────────────────────────────

    pub async fn spawn_agent(&self, profile: AgentProfile) -> SwarmResult<AgentId> {
        self.ensure_running()?;
        let priority = profile.priority;
        let id = self.inner.registry.spawn(profile).await?;

        self.inner.router.add_member(id);
        self.inner.ledger.set_priority(id, priority);
        self.inner.heartbeats.lock().track(id, Instant::now());
        self.persist_agent(id).await;
        Ok(id)
    }

    /// Terminate an agent. Its tasks return to the queue without consuming
    /// an attempt and its locks are released.
    pub async fn terminate_agent(&self, id: AgentId, graceful: bool) -> SwarmResult<()> {
        self.ensure_running()?;
        let mut agent = self.inner.registry.lock(id).await?;
        self.inner.registry.begin_termination(&mut agent, graceful).await?;

        self.detach(id, "agent terminated", false).await;
        self.inner.ledger.forget(id, "agent terminated");
        self.inner.registry.finish_termination(&mut agent).await?;
        self.inner.snapshots.remove(EntityKind::Agent, &id.to_string()).await;
        Ok(())
    }

    pub async fn heartbeat(&self, id: AgentId) -> SwarmResult<()> {
        self.inner.registry.heartbeat(id).await?;
        let mut heartbeats = self.inner.heartbeats.lock();
        if heartbeats.deadline(id).is_some() {
            heartbeats.beat(id, Instant::now());
        }
        Ok(())
    }

    pub async fn agent(&self, id: AgentId) -> SwarmResult<Agent> {
        self.inner.registry.get(id).await
    }

    pub async fn agents(&self, filter: &AgentFilter) -> Vec<Agent> {
        self.inner.registry.list(filter).await
    }

    /// Remove a lost agent from everything but the registry.
    async fn detach(&self, id: AgentId, reason: &str, count_attempt: bool) {
        let settled = self.inner.queue.requeue_for_agent(id, reason, count_attempt);
        let released = self.inner.ledger.release_all(id, reason);
        self.inner.router.remove_member(id);
        self.inner.heartbeats.lock().untrack(id);
        self.inner.causal.lock().forget(id);

        if !released.is_empty() {
            debug!(agent_id = %id, locks = released.len(), "Released locks of detached agent");
        }
        self.publish_settlements(settled, reason).await;
    }

    async fn publish_settlements(&self, settled: Vec<(TaskId, Settlement)>, reason: &str) {
        for (task_id, settlement) in settled {
            match settlement {
                Settlement::Retried(outcome) => self.publish_failure(task_id, &outcome, reason).await,
                Settlement::Released => {
                    let retry_count = self.inner.queue.get(task_id).map(|t| t.retry_count).unwrap_or(0);
                    self.inner.event_bus.publish_task_event(TaskEvent::TaskRequeued {
                        task_id,
                        retry_count,
                        error: reason.to_string(),
                        requeued_at: Utc::now(),
                    });
                    self.persist_task(task_id).await;
                }
                Settlement::Cancelled(cancellation) => {
                    self.take_cancel_timer(task_id);
                    self.publish_cancellation(&cancellation, "cancelled while agent was lost").await;
                }
            }
        }
    }

    /// Crash path: the agent goes to `Error`, its work is settled and it is
    /// restarted if its profile allows. Returns whether it was restarted.
    async fn handle_agent_failure(&self, id: AgentId, reason: &str) -> bool {
        let Ok(mut agent) = self.inner.registry.lock(id).await else {
            return false;
        };
        if !agent.state.is_live() {
            return false;
        }
        let last_heartbeat = agent.last_heartbeat;
        if let Err(e) = self
            .inner
            .registry
            .apply(&mut agent, AgentEvent::Fail(reason.to_string()), false)
            .await
        {
            warn!(agent_id = %id, "Could not mark agent failed: {}", e);
            return false;
        }
        warn!(agent_id = %id, "Agent '{}' failed: {}", agent.name(), reason);
        metrics::counter!("aegis_swarm_heartbeat_timeouts_total").increment(1);
        self.inner
            .event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentHeartbeatMissed {
                agent_id: id,
                last_heartbeat,
                detected_at: Utc::now(),
            });

        self.detach(id, reason, true).await;

        if agent.can_restart(self.inner.config.max_agent_restarts) {
            match self.inner.registry.restart(&mut agent).await {
                Ok(_) => {
                    self.inner.router.add_member(id);
                    self.inner.heartbeats.lock().track(id, Instant::now());
                    self.inner.snapshots.agent(&agent).await;
                    info!(agent_id = %id, restarts = agent.restart_count, "Agent restarted");
                    return true;
                }
                Err(e) => warn!(agent_id = %id, "Agent restart failed: {}", e),
            }
        }

        // Stays registered in `Error` until terminated
        self.inner.ledger.forget(id, reason);
        self.inner.snapshots.agent(&agent).await;
        false
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub async fn submit_task(&self, spec: TaskSpec) -> SwarmResult<TaskId> {
        self.ensure_running()?;
        let task = self.inner.queue.submit(spec)?;
        self.inner.event_bus.publish_task_event(TaskEvent::TaskSubmitted {
            task_id: task.id,
            priority: task.priority,
            submitted_at: task.created_at,
        });
        self.inner.snapshots.task(&task).await;
        Ok(task.id)
    }

    /// Hand the best eligible task to an idle agent.
    pub async fn dispatch(&self, agent_id: AgentId) -> SwarmResult<Option<Task>> {
        self.ensure_running()?;
        let mut agent = self.inner.registry.lock(agent_id).await?;
        if agent.state != AgentState::Idle {
            return Err(TransitionError::Invalid {
                from: agent.state,
                event: "assign",
            }
            .into());
        }

        let Some(task) = self.inner.queue.next(agent_id, &agent.profile.capabilities) else {
            return Ok(None);
        };
        if let Err(e) = self
            .inner
            .registry
            .apply(&mut agent, AgentEvent::Assign(task.id), true)
            .await
        {
            // A concurrent cancel may already have settled the task
            if let Err(rollback) = self.inner.queue.unassign(task.id) {
                debug!(task_id = %task.id, "Assignment rollback skipped: {}", rollback);
            }
            return Err(e);
        }

        info!(task_id = %task.id, agent_id = %agent_id, priority = task.priority, "Task assigned");
        self.inner.event_bus.publish_task_event(TaskEvent::TaskAssigned {
            task_id: task.id,
            agent_id,
            assigned_at: Utc::now(),
        });
        self.inner.snapshots.agent(&agent).await;
        self.inner.snapshots.task(&task).await;
        Ok(Some(task))
    }

    /// Like [`Self::dispatch`], waiting up to `timeout` for eligible work.
    pub async fn dispatch_blocking(&self, agent_id: AgentId, timeout: Duration) -> SwarmResult<Option<Task>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.queue.changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.dispatch(agent_id).await? {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn task_on_agent(&self, agent_id: AgentId, task_id: TaskId, operation: &'static str) -> SwarmResult<Task> {
        let task = self
            .inner
            .queue
            .get(task_id)
            .ok_or_else(|| SwarmError::task_not_found(task_id))?;
        if task.assigned_agent != Some(agent_id) {
            return Err(SwarmError::InvalidTaskState {
                task: task_id,
                state: task.state,
                operation,
            });
        }
        Ok(task)
    }

    pub async fn start_task(&self, agent_id: AgentId, task_id: TaskId) -> SwarmResult<Task> {
        self.ensure_running()?;
        let _agent = self.inner.registry.lock(agent_id).await?;
        self.task_on_agent(agent_id, task_id, "start")?;
        let task = self.inner.queue.start(task_id)?;

        debug!(task_id = %task_id, agent_id = %agent_id, "Task started");
        self.inner.event_bus.publish_task_event(TaskEvent::TaskStarted {
            task_id,
            agent_id,
            started_at: Utc::now(),
        });
        self.inner.snapshots.task(&task).await;
        Ok(task)
    }

    /// Record a result. Completing an already completed task is a no-op
    /// returning `false`.
    pub async fn complete_task(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        result: serde_json::Value,
    ) -> SwarmResult<bool> {
        self.ensure_running()?;
        let mut agent = self.inner.registry.lock(agent_id).await?;
        let task = self
            .inner
            .queue
            .get(task_id)
            .ok_or_else(|| SwarmError::task_not_found(task_id))?;
        if task.state == TaskState::Completed {
            return Ok(false);
        }
        self.task_on_agent(agent_id, task_id, "complete")?;

        self.inner
            .registry
            .apply(&mut agent, AgentEvent::Release, true)
            .await?;
        let changed = match self.inner.queue.complete(task_id, result) {
            Ok(changed) => changed,
            Err(e) => {
                self.rollback_release(&mut agent, task_id).await;
                return Err(e);
            }
        };

        self.take_cancel_timer(task_id);
        if changed {
            info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
            metrics::counter!("aegis_swarm_tasks_completed_total").increment(1);
            self.inner.event_bus.publish_task_event(TaskEvent::TaskCompleted {
                task_id,
                agent_id: Some(agent_id),
                completed_at: Utc::now(),
            });
        }
        self.inner.snapshots.agent(&agent).await;
        self.persist_task(task_id).await;
        Ok(changed)
    }

    /// Report a failed attempt. The task is retried or dead-lettered.
    pub async fn fail_task(&self, agent_id: AgentId, task_id: TaskId, error: &str) -> SwarmResult<FailOutcome> {
        self.ensure_running()?;
        let mut agent = self.inner.registry.lock(agent_id).await?;
        self.task_on_agent(agent_id, task_id, "fail")?;

        self.inner
            .registry
            .apply(&mut agent, AgentEvent::Release, true)
            .await?;
        let outcome = match self.inner.queue.fail(task_id, error) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.rollback_release(&mut agent, task_id).await;
                return Err(e);
            }
        };

        self.take_cancel_timer(task_id);
        if matches!(outcome, FailOutcome::Cancelled(_)) {
            self.inner.ledger.release_all(agent_id, "task cancelled");
        }
        self.inner.snapshots.agent(&agent).await;
        self.publish_failure(task_id, &outcome, error).await;
        Ok(outcome)
    }

    async fn rollback_release(&self, agent: &mut Agent, task_id: TaskId) {
        if let Err(e) = self
            .inner
            .registry
            .apply(agent, AgentEvent::Assign(task_id), false)
            .await
        {
            self.halt(format!(
                "agent {} released task {} but could not be re-assigned: {}",
                agent.id, task_id, e
            ));
        }
    }

    async fn publish_failure(&self, task_id: TaskId, outcome: &FailOutcome, error: &str) {
        match outcome {
            FailOutcome::Requeued { retry_count } => {
                self.inner.event_bus.publish_task_event(TaskEvent::TaskRequeued {
                    task_id,
                    retry_count: *retry_count,
                    error: error.to_string(),
                    requeued_at: Utc::now(),
                });
            }
            FailOutcome::DeadLettered {
                retry_count,
                cancelled_dependents,
            } => {
                metrics::counter!("aegis_swarm_tasks_dead_lettered_total").increment(1);
                self.inner.event_bus.publish_task_event(TaskEvent::TaskDeadLettered {
                    task_id,
                    retry_count: *retry_count,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                });
                for dependent in cancelled_dependents {
                    self.publish_cancelled(*dependent, &format!("dependency {} failed", task_id))
                        .await;
                }
            }
            FailOutcome::Cancelled(cancellation) => {
                info!(task_id = %task_id, "Task cancelled after its agent stopped it: {}", error);
                self.publish_cancellation(cancellation, "cancelled by request").await;
                return;
            }
        }
        self.persist_task(task_id).await;
    }

    /// Cancel a task. Running tasks get a grace period to acknowledge before
    /// the cancellation is forced.
    pub async fn cancel_task(&self, task_id: TaskId) -> SwarmResult<CancelOutcome> {
        self.ensure_running()?;
        let outcome = self.inner.queue.cancel(task_id)?;
        match &outcome {
            CancelOutcome::Cancelled(cancellation) => {
                self.finish_cancellation(cancellation, "cancelled").await;
            }
            CancelOutcome::Pending { agent } => {
                info!(task_id = %task_id, agent_id = %agent, "Cancellation requested");
                self.inner.event_bus.publish_task_event(TaskEvent::TaskCancelRequested {
                    task_id,
                    agent_id: *agent,
                    requested_at: Utc::now(),
                });
                self.persist_task(task_id).await;
                self.start_cancel_timer(task_id);
            }
            CancelOutcome::AlreadyTerminal(state) => {
                debug!(task_id = %task_id, state = %state, "Cancel on terminal task ignored");
            }
        }
        Ok(outcome)
    }

    /// The agent stopped a task whose cancellation was requested.
    pub async fn acknowledge_cancel(&self, agent_id: AgentId, task_id: TaskId) -> SwarmResult<()> {
        self.ensure_running()?;
        self.task_on_agent(agent_id, task_id, "acknowledge cancellation")?;
        let cancellation = self.inner.queue.acknowledge_cancel(task_id)?;
        self.finish_cancellation(&cancellation, "cancelled by request").await;
        Ok(())
    }

    fn start_cancel_timer(&self, task_id: TaskId) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let grace = self.inner.config.cancel_grace;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let orchestrator = SwarmOrchestrator { inner };
            // Deregister without aborting; this is the running timer
            orchestrator.inner.cancel_timers.lock().remove(&task_id);
            if let Some(cancellation) = orchestrator.inner.queue.force_cancel(task_id) {
                warn!(task_id = %task_id, grace = ?grace, "Cancellation not acknowledged; forcing");
                orchestrator
                    .finish_cancellation(&cancellation, "cancel grace period expired")
                    .await;
            }
        });
        if let Some(previous) = self.inner.cancel_timers.lock().insert(task_id, timer) {
            previous.abort();
        }
    }

    fn take_cancel_timer(&self, task_id: TaskId) {
        if let Some(timer) = self.inner.cancel_timers.lock().remove(&task_id) {
            timer.abort();
        }
    }

    /// Return the agent to `Idle`, sweep its locks and announce the cancellation.
    async fn finish_cancellation(&self, cancellation: &Cancellation, reason: &str) {
        self.take_cancel_timer(cancellation.task_id);
        if let Some(agent_id) = cancellation.agent {
            if let Ok(mut agent) = self.inner.registry.lock(agent_id).await {
                if agent.state == AgentState::Busy && agent.assigned_task == Some(cancellation.task_id) {
                    if let Err(e) = self
                        .inner
                        .registry
                        .apply(&mut agent, AgentEvent::Release, false)
                        .await
                    {
                        warn!(agent_id = %agent_id, "Could not release agent after cancellation: {}", e);
                    }
                    self.inner.snapshots.agent(&agent).await;
                }
            }
            self.inner.ledger.release_all(agent_id, "task cancelled");
        }
        self.publish_cancellation(cancellation, reason).await;
    }

    async fn publish_cancellation(&self, cancellation: &Cancellation, reason: &str) {
        self.publish_cancelled(cancellation.task_id, reason).await;
        let cascade_reason = format!("dependency {} cancelled", cancellation.task_id);
        for dependent in &cancellation.cascaded {
            self.publish_cancelled(*dependent, &cascade_reason).await;
        }
    }

    async fn publish_cancelled(&self, task_id: TaskId, reason: &str) {
        metrics::counter!("aegis_swarm_tasks_cancelled_total").increment(1);
        self.inner.event_bus.publish_task_event(TaskEvent::TaskCancelled {
            task_id,
            reason: reason.to_string(),
            cancelled_at: Utc::now(),
        });
        self.persist_task(task_id).await;
    }

    pub fn task(&self, id: TaskId) -> SwarmResult<Task> {
        self.inner.queue.get(id).ok_or_else(|| SwarmError::task_not_found(id))
    }

    pub fn tasks(&self, state: Option<TaskState>) -> Vec<Task> {
        self.inner.queue.list(state)
    }

    /// Reload tasks from the state store. In-flight tasks return to the queue.
    pub async fn restore_tasks(&self) -> SwarmResult<usize> {
        self.ensure_running()?;
        let tasks = self
            .inner
            .snapshots
            .load_tasks()
            .await
            .map_err(|e| SwarmError::Persistence(e.to_string()))?;
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let restored = self.inner.queue.restore(tasks);
        for id in ids {
            self.persist_task(id).await;
        }
        Ok(restored)
    }

    // ── Consensus ─────────────────────────────────────────────────────────

    /// Open a proposal voted on by every current member.
    pub async fn propose(&self, proposer: AgentId, payload: serde_json::Value) -> SwarmResult<ProposalId> {
        self.ensure_running()?;
        self.require_live(proposer).await?;

        let proposal_id = ProposalId::new();
        let result = {
            let mut causal = self.inner.causal.lock();
            let update = causal.stamp(
                proposer,
                SwarmUpdate::Propose {
                    proposal_id,
                    payload,
                },
            );
            self.deliver(&mut causal, update)
        };
        result?;
        self.persist_proposal(proposal_id).await;
        Ok(proposal_id)
    }

    pub async fn vote(&self, voter: AgentId, proposal_id: ProposalId, approve: bool) -> SwarmResult<ProposalOutcome> {
        self.ensure_running()?;
        self.require_live(voter).await?;

        let result = {
            let mut causal = self.inner.causal.lock();
            let update = causal.stamp(voter, SwarmUpdate::Vote { proposal_id, approve });
            self.deliver(&mut causal, update)
        };
        let outcome = result?.unwrap_or(ProposalOutcome::Pending);
        if outcome.is_decided() {
            self.persist_proposal(proposal_id).await;
        }
        Ok(outcome)
    }

    /// Apply an update stamped elsewhere. Returns how many buffered updates
    /// became deliverable, including this one.
    pub fn relay(&self, update: CausalUpdate<SwarmUpdate>) -> SwarmResult<usize> {
        self.ensure_running()?;
        let mut causal = self.inner.causal.lock();
        let delivered = causal.receive(update);
        let count = delivered.len();
        for update in delivered {
            if let Err(e) = self.apply_update(update) {
                warn!("Relayed update rejected: {}", e);
            }
        }
        Ok(count)
    }

    /// Receive a locally stamped update and apply everything it unblocks.
    /// The result is that of `update` itself.
    fn deliver(
        &self,
        causal: &mut CausalDelivery<SwarmUpdate>,
        update: CausalUpdate<SwarmUpdate>,
    ) -> SwarmResult<Option<ProposalOutcome>> {
        let origin = update.origin;
        let stamp = update.clock.clone();
        let mut result = Err(SwarmError::InvariantViolation(format!(
            "update from {} was not delivered",
            origin
        )));
        for delivered in causal.receive(update) {
            let own = delivered.origin == origin && delivered.clock == stamp;
            let applied = self.apply_update(delivered);
            if own {
                result = applied;
            } else if let Err(e) = applied {
                warn!("Buffered update rejected: {}", e);
            }
        }
        result
    }

    fn apply_update(&self, update: CausalUpdate<SwarmUpdate>) -> SwarmResult<Option<ProposalOutcome>> {
        match update.payload {
            SwarmUpdate::Propose { proposal_id, payload } => {
                let swarm = self.inner.router.snapshot();
                let delivered_to = self.inner.router.reachable(update.origin);
                self.inner.consensus.propose(
                    &swarm,
                    ProposalDraft {
                        id: proposal_id,
                        proposer: update.origin,
                        payload,
                        delivered_to,
                        clock: update.clock,
                    },
                )?;
                Ok(None)
            }
            SwarmUpdate::Vote { proposal_id, approve } => self
                .inner
                .consensus
                .vote(proposal_id, update.origin, approve)
                .map(Some),
        }
    }

    async fn require_live(&self, id: AgentId) -> SwarmResult<()> {
        let agent = self.inner.registry.get(id).await?;
        if agent.state.is_live() {
            Ok(())
        } else {
            Err(SwarmError::agent_not_found(id))
        }
    }

    pub fn outcome(&self, id: ProposalId) -> SwarmResult<ProposalOutcome> {
        self.inner.consensus.outcome(id)
    }

    pub fn proposal(&self, id: ProposalId) -> SwarmResult<Proposal> {
        self.inner.consensus.proposal(id)
    }

    pub async fn await_outcome(&self, id: ProposalId) -> SwarmResult<ProposalOutcome> {
        let outcome = self.inner.consensus.await_outcome(id).await;
        self.persist_proposal(id).await;
        outcome
    }

    pub async fn cancel_proposal(&self, id: ProposalId) -> SwarmResult<bool> {
        self.ensure_running()?;
        let cancelled = self.inner.consensus.cancel(id)?;
        if cancelled {
            self.persist_proposal(id).await;
        }
        Ok(cancelled)
    }

    // ── Locks ─────────────────────────────────────────────────────────────

    /// Acquire a resource lock, retrying timeouts per `lock_retry`. A
    /// deadlock victim or an evicted waiter is never retried.
    pub async fn acquire(&self, agent: AgentId, resource: &str, timeout: Duration) -> SwarmResult<()> {
        self.ensure_running()?;
        self.require_live(agent).await?;

        let policy = &self.inner.config.lock_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.ledger.acquire(agent, resource, timeout).await {
                Err(SwarmError::LockTimeout {
                    deadlock_victim: false,
                    ..
                }) if attempt < max_attempts => {
                    let delay = policy.backoff(attempt);
                    debug!(agent_id = %agent, resource, attempt, "Lock timeout; retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    self.ensure_running()?;
                    self.require_live(agent).await?;
                    attempt += 1;
                }
                Ok(()) => return self.keep_if_live(agent).await,
                result => return result,
            }
        }
    }

    pub async fn acquire_all(&self, agent: AgentId, resources: &[String], timeout: Duration) -> SwarmResult<()> {
        self.ensure_running()?;
        self.require_live(agent).await?;
        self.inner.ledger.acquire_all(agent, resources, timeout).await?;
        self.keep_if_live(agent).await
    }

    /// An agent that failed while its acquire was in flight must not keep
    /// what it was granted once its cleanup has run.
    async fn keep_if_live(&self, agent: AgentId) -> SwarmResult<()> {
        if let Err(e) = self.require_live(agent).await {
            let released = self.inner.ledger.release_all(agent, "agent failed while acquiring");
            if !released.is_empty() {
                warn!(agent_id = %agent, locks = released.len(), "Dropped locks granted to a failed agent");
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn release(&self, agent: AgentId, resource: &str) -> SwarmResult<()> {
        self.ensure_running()?;
        self.inner.ledger.release(agent, resource)
    }

    pub fn held_locks(&self, agent: AgentId) -> Vec<String> {
        self.inner.ledger.held_by(agent)
    }

    pub fn lock_holder(&self, resource: &str) -> Option<AgentId> {
        self.inner.ledger.holder(resource).map(|lock| lock.held_by)
    }

    // ── Topology ──────────────────────────────────────────────────────────

    /// Switch topology in place. Every pending proposal is aborted.
    pub async fn reconfigure(&self, topology: Topology) -> SwarmResult<ReconfigureReport> {
        self.ensure_running()?;
        let report = self.inner.router.reconfigure(topology)?;
        let aborted = self.inner.consensus.abort_pending(AbortReason::Reconfigured);
        if aborted > 0 {
            info!(aborted, epoch = report.epoch, "Pending proposals aborted by reconfiguration");
        }
        self.inner.event_bus.publish_swarm_event(SwarmEvent::TopologyReconfigured {
            swarm_id: self.inner.swarm_id,
            from: report.from.to_string(),
            to: report.to.to_string(),
            epoch: report.epoch,
            aborted_proposals: aborted,
            reconfigured_at: Utc::now(),
        });
        Ok(report)
    }

    pub fn neighbors(&self, agent: AgentId) -> std::collections::BTreeSet<AgentId> {
        self.inner.router.neighbors(agent)
    }

    pub fn members(&self) -> Vec<AgentId> {
        self.inner.router.members()
    }

    pub async fn status(&self) -> SwarmStatus {
        let swarm = self.inner.router.snapshot();
        let agents = self.inner.registry.list(&AgentFilter::default()).await;
        let mut agents_by_state: BTreeMap<String, usize> = BTreeMap::new();
        for agent in &agents {
            *agents_by_state.entry(agent.state.as_str().to_string()).or_default() += 1;
        }

        let stats = self.inner.queue.stats();
        let tasks_by_state: BTreeMap<String, usize> = [
            (TaskState::Queued, stats.queued),
            (TaskState::Assigned, stats.assigned),
            (TaskState::Running, stats.running),
            (TaskState::Completed, stats.completed),
            (TaskState::Cancelled, stats.cancelled),
            (TaskState::Failed, stats.failed),
        ]
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(state, n)| (state.as_str().to_string(), n))
        .collect();

        SwarmStatus {
            swarm_id: swarm.id,
            name: swarm.name,
            topology: swarm.topology,
            epoch: swarm.epoch,
            members: swarm.members,
            live_agents: self.inner.registry.live_count(),
            max_agents: self.inner.registry.max_agents(),
            agents_by_state,
            tasks_by_state,
            queue_capacity: stats.capacity,
            pending_proposals: self.inner.consensus.pending_count(),
            held_locks: self.inner.ledger.held_count(),
            halted: self.inner.halted.read().clone(),
        }
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// One pass of heartbeat sweep, deadlock resolution, proposal expiry,
    /// retention GC and integrity check.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_halted() {
            return report;
        }

        let now = Instant::now();
        let expired = self.inner.heartbeats.lock().expired(now);
        for agent in expired {
            if self.handle_agent_failure(agent, "heartbeat timeout").await {
                report.restarted_agents.push(agent);
            }
            report.expired_agents.push(agent);
        }

        let resolutions: Vec<DeadlockResolution> = self.inner.ledger.resolve_deadlocks();
        report.deadlocks_resolved = resolutions.len();

        report.expired_proposals = self.inner.consensus.expire(now);
        for id in &report.expired_proposals {
            self.persist_proposal(*id).await;
        }
        report.collected_proposals = self
            .inner
            .consensus
            .gc(now, self.inner.config.proposal_retention);

        if let Err(e) = self.inner.ledger.verify() {
            let reason = e.to_string();
            self.halt(reason.clone());
            report.halted = Some(reason);
        }

        metrics::gauge!("aegis_swarm_queue_depth").set(self.inner.queue.active_count() as f64);
        metrics::gauge!("aegis_swarm_pending_proposals").set(self.inner.consensus.pending_count() as f64);
        report
    }

    /// Start the background maintenance loop. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            info!(interval = ?period, "Starting swarm maintenance loop");
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let report = SwarmOrchestrator { inner }.run_maintenance().await;
                        if !report.expired_agents.is_empty() || report.deadlocks_resolved > 0 {
                            info!(
                                expired_agents = report.expired_agents.len(),
                                deadlocks = report.deadlocks_resolved,
                                "Maintenance pass recovered the swarm"
                            );
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Shutdown signal received, stopping swarm maintenance");
                        break;
                    }
                }
            }
        });
        *slot = Some((token, handle));
        true
    }

    /// Stop maintenance, cancel grace timers and terminate every agent.
    pub async fn shutdown(&self) {
        let maintenance = self.inner.maintenance.lock().take();
        if let Some((token, handle)) = maintenance {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Maintenance loop ended abnormally: {}", e);
            }
        }
        let timers: Vec<JoinHandle<()>> = self.inner.cancel_timers.lock().drain().map(|(_, t)| t).collect();
        for timer in timers {
            timer.abort();
        }

        for id in self.inner.registry.ids() {
            let Ok(mut agent) = self.inner.registry.lock(id).await else {
                continue;
            };
            if let Err(e) = self.inner.registry.begin_termination(&mut agent, false).await {
                warn!(agent_id = %id, "Shutdown could not stop agent: {}", e);
                continue;
            }
            self.detach(id, "swarm shutdown", false).await;
            self.inner.ledger.forget(id, "swarm shutdown");
            if let Err(e) = self.inner.registry.finish_termination(&mut agent).await {
                warn!(agent_id = %id, "Shutdown could not finish agent termination: {}", e);
            }
        }
        info!(swarm_id = %self.inner.swarm_id, "Swarm shut down");
    }

    // ── Persistence ───────────────────────────────────────────────────────

    async fn persist_agent(&self, id: AgentId) {
        if self.inner.snapshots.store().is_none() {
            return;
        }
        if let Ok(agent) = self.inner.registry.get(id).await {
            self.inner.snapshots.agent(&agent).await;
        }
    }

    async fn persist_task(&self, id: TaskId) {
        if let Some(task) = self.inner.queue.get(id) {
            self.inner.snapshots.task(&task).await;
        }
    }

    async fn persist_proposal(&self, id: ProposalId) {
        if let Ok(proposal) = self.inner.consensus.proposal(id) {
            self.inner.snapshots.proposal(&proposal).await;
        }
    }

    #[cfg(test)]
    fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::infrastructure::repositories::InMemoryStateStore;
    use serde_json::json;

    fn config() -> SwarmConfig {
        SwarmConfig {
            max_agents: 4,
            heartbeat_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn profile(name: &str) -> AgentProfile {
        AgentProfile::new(name, "worker")
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = SwarmConfig {
            consensus_threshold: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            SwarmOrchestrator::builder(config).build(),
            Err(SwarmError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_start_complete() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let agent = swarm.spawn_agent(profile("a")).await.unwrap();
        let task_id = swarm.submit_task(TaskSpec::new("build")).await.unwrap();

        let task = swarm.dispatch(agent).await.unwrap().unwrap();
        assert_eq!(task.id, task_id);
        assert_eq!(swarm.agent(agent).await.unwrap().state, AgentState::Busy);
        assert!(matches!(
            swarm.dispatch(agent).await,
            Err(SwarmError::InvalidTransition(_))
        ));

        swarm.start_task(agent, task_id).await.unwrap();
        assert!(swarm.complete_task(agent, task_id, json!("ok")).await.unwrap());
        assert!(!swarm.complete_task(agent, task_id, json!("again")).await.unwrap());

        let agent = swarm.agent(agent).await.unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.assigned_task.is_none());
        assert_eq!(swarm.task(task_id).unwrap().result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_fail_task_returns_agent_to_idle() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let agent = swarm.spawn_agent(profile("a")).await.unwrap();
        let task_id = swarm.submit_task(TaskSpec::new("flaky")).await.unwrap();
        swarm.dispatch(agent).await.unwrap();
        swarm.start_task(agent, task_id).await.unwrap();

        let outcome = swarm.fail_task(agent, task_id, "exit 1").await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued { retry_count: 1 });
        assert_eq!(swarm.agent(agent).await.unwrap().state, AgentState::Idle);
        assert_eq!(swarm.task(task_id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_complete_by_wrong_agent_is_rejected() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let a = swarm.spawn_agent(profile("a")).await.unwrap();
        let b = swarm.spawn_agent(profile("b")).await.unwrap();
        let task_id = swarm.submit_task(TaskSpec::new("t")).await.unwrap();
        swarm.dispatch(a).await.unwrap();
        swarm.start_task(a, task_id).await.unwrap();

        assert!(matches!(
            swarm.complete_task(b, task_id, json!(null)).await,
            Err(SwarmError::InvalidTaskState { .. })
        ));
        assert_eq!(swarm.agent(a).await.unwrap().state, AgentState::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_grace_expiry_forces_cancellation() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let agent = swarm.spawn_agent(profile("a")).await.unwrap();
        let task_id = swarm.submit_task(TaskSpec::new("long")).await.unwrap();
        swarm.dispatch(agent).await.unwrap();
        swarm.start_task(agent, task_id).await.unwrap();
        swarm.acquire(agent, "repo", Duration::from_secs(1)).await.unwrap();

        let outcome = swarm.cancel_task(task_id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Pending { agent });
        assert_eq!(swarm.task(task_id).unwrap().state, TaskState::Running);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(swarm.task(task_id).unwrap().state, TaskState::Cancelled);
        assert_eq!(swarm.agent(agent).await.unwrap().state, AgentState::Idle);
        assert!(swarm.held_locks(agent).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_cancel_stops_timer() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let agent = swarm.spawn_agent(profile("a")).await.unwrap();
        let task_id = swarm.submit_task(TaskSpec::new("long")).await.unwrap();
        swarm.dispatch(agent).await.unwrap();
        swarm.start_task(agent, task_id).await.unwrap();
        swarm.cancel_task(task_id).await.unwrap();

        swarm.acknowledge_cancel(agent, task_id).await.unwrap();
        assert_eq!(swarm.task(task_id).unwrap().state, TaskState::Cancelled);
        assert!(swarm.inner.cancel_timers.lock().is_empty());
        assert_eq!(swarm.agent(agent).await.unwrap().state, AgentState::Idle);
    }

    #[tokio::test]
    async fn test_terminate_busy_agent_requeues_without_counting() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let agent = swarm.spawn_agent(profile("a")).await.unwrap();
        let task_id = swarm.submit_task(TaskSpec::new("t")).await.unwrap();
        swarm.dispatch(agent).await.unwrap();

        swarm.terminate_agent(agent, true).await.unwrap();
        let task = swarm.task(task_id).unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.retry_count, 0);
        assert!(swarm.members().is_empty());
        assert!(matches!(swarm.agent(agent).await, Err(SwarmError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_reconfigure_aborts_pending_proposals() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let a = swarm.spawn_agent(profile("a")).await.unwrap();
        swarm.spawn_agent(profile("b")).await.unwrap();

        let proposal = swarm.propose(a, json!({"op": "rotate"})).await.unwrap();
        swarm.reconfigure(Topology::Ring).await.unwrap();
        assert_eq!(
            swarm.outcome(proposal).unwrap(),
            ProposalOutcome::Aborted(AbortReason::Reconfigured)
        );
        assert!(matches!(swarm.vote(a, proposal, true).await, Err(SwarmError::LateVote(_))));
    }

    #[tokio::test]
    async fn test_corruption_halts_until_reset() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        let agent = swarm.spawn_agent(profile("a")).await.unwrap();
        swarm.ledger().corrupt_index(agent, "phantom");

        let report = swarm.run_maintenance().await;
        assert!(report.halted.is_some());
        assert!(matches!(
            swarm.submit_task(TaskSpec::new("x")).await,
            Err(SwarmError::SwarmHalted(_))
        ));
        assert!(swarm.status().await.halted.is_some());

        swarm.reset();
        assert!(swarm.submit_task(TaskSpec::new("x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_tasks_from_store() {
        let store = Arc::new(InMemoryStateStore::default());
        let first = SwarmOrchestrator::builder(config())
            .store(store.clone())
            .build()
            .unwrap();
        let agent = first.spawn_agent(profile("a")).await.unwrap();
        let done = first.submit_task(TaskSpec::new("done")).await.unwrap();
        first.dispatch(agent).await.unwrap();
        first.start_task(agent, done).await.unwrap();
        first.complete_task(agent, done, json!(1)).await.unwrap();
        let in_flight = first.submit_task(TaskSpec::new("in flight")).await.unwrap();
        first.dispatch(agent).await.unwrap();

        let second = SwarmOrchestrator::builder(config()).store(store).build().unwrap();
        assert_eq!(second.restore_tasks().await.unwrap(), 2);
        assert_eq!(second.task(done).unwrap().state, TaskState::Completed);
        let restored = second.task(in_flight).unwrap();
        assert_eq!(restored.state, TaskState::Queued);
        assert!(restored.assigned_agent.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_start_and_shutdown() {
        let swarm = SwarmOrchestrator::builder(config()).build().unwrap();
        swarm.spawn_agent(profile("a")).await.unwrap();
        assert!(swarm.start());
        assert!(!swarm.start());

        tokio::time::sleep(Duration::from_secs(2)).await;
        swarm.shutdown().await;
        assert_eq!(swarm.status().await.live_agents, 0);
        assert!(swarm.inner.maintenance.lock().is_none());
    }
}
