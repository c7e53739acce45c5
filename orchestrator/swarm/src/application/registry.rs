// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry
//!
//! Authoritative map of agent identity to lifecycle state.
//!
//! Each record sits behind its own async mutex, so transitions on one agent
//! are strictly sequential while unrelated agents proceed in parallel.
//! Admission is a compare-and-swap on the live-agent counter: a slot is
//! reserved before the record exists and released when the agent leaves a
//! live state, so concurrent spawns cannot overshoot `max_agents`.

use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::{Agent, AgentEvent, AgentId, AgentProfile, AgentState};
use aegis_core::domain::events::AgentLifecycleEvent;
use aegis_core::domain::hooks::{HookDecision, TransitionEvent, TransitionHook};
use aegis_core::domain::runtime::{AgentRuntime, InstanceId};
use aegis_core::domain::swarm_config::RetryPolicy;
use aegis_core::infrastructure::event_bus::EventBus;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Selection criteria for [`AgentRegistry::list`]; empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub state: Option<AgentState>,
    pub role: Option<String>,
    pub capability: Option<String>,
}

impl AgentFilter {
    pub fn state(state: AgentState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.state.map_or(true, |s| agent.state == s)
            && self.role.as_ref().map_or(true, |r| &agent.profile.role == r)
            && self
                .capability
                .as_ref()
                .map_or(true, |c| agent.profile.capabilities.contains(c))
    }
}

pub struct RegistrySettings {
    pub max_agents: usize,
    pub max_restarts: u32,
    pub spawn_retry: RetryPolicy,
}

pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<Mutex<Agent>>>,
    live: AtomicUsize,
    settings: RegistrySettings,
    runtime: Arc<dyn AgentRuntime>,
    hooks: Vec<Arc<dyn TransitionHook>>,
    post_hooks: Option<mpsc::UnboundedSender<TransitionEvent>>,
    event_bus: EventBus,
}

impl AgentRegistry {
    /// Must be called inside a tokio runtime when `hooks` is non-empty.
    pub fn new(
        settings: RegistrySettings,
        runtime: Arc<dyn AgentRuntime>,
        hooks: Vec<Arc<dyn TransitionHook>>,
        event_bus: EventBus,
    ) -> Self {
        let post_hooks = Self::spawn_post_hook_worker(&hooks);
        Self {
            agents: DashMap::new(),
            live: AtomicUsize::new(0),
            settings,
            runtime,
            hooks,
            post_hooks,
            event_bus,
        }
    }

    fn spawn_post_hook_worker(
        hooks: &[Arc<dyn TransitionHook>],
    ) -> Option<mpsc::UnboundedSender<TransitionEvent>> {
        if hooks.is_empty() {
            return None;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available; post-transition hooks are disabled");
                return None;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<TransitionEvent>();
        let hooks = hooks.to_vec();
        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                for hook in &hooks {
                    hook.after_transition(&event).await;
                }
            }
            debug!("Post-transition hook worker stopped");
        });
        Some(tx)
    }

    pub fn max_agents(&self) -> usize {
        self.settings.max_agents
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn reserve_slot(&self) -> SwarmResult<()> {
        let max = self.settings.max_agents;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| SwarmError::AgentLimit { max })
    }

    fn free_slot(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn handle(&self, id: AgentId) -> SwarmResult<Arc<Mutex<Agent>>> {
        self.agents
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SwarmError::agent_not_found(id))
    }

    /// Lock an agent record for a multi-step operation.
    pub async fn lock(&self, id: AgentId) -> SwarmResult<OwnedMutexGuard<Agent>> {
        Ok(self.handle(id)?.lock_owned().await)
    }

    /// Admit, provision and ready a new agent.
    pub async fn spawn(&self, profile: AgentProfile) -> SwarmResult<AgentId> {
        self.reserve_slot()?;

        let agent = Agent::new(profile);
        let id = agent.id;
        let handle = Arc::new(Mutex::new(agent));
        // Hold the record while provisioning so nothing can transition it half-built
        let mut guard = handle.clone().lock_owned().await;
        self.agents.insert(id, handle);

        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentSpawned {
            agent_id: id,
            name: guard.profile.name.clone(),
            role: guard.profile.role.clone(),
            spawned_at: Utc::now(),
        });

        let instance = match self.launch_with_retry(id, &guard.profile).await {
            Ok(instance) => instance,
            Err(e) => {
                self.remove(&guard);
                return Err(e);
            }
        };
        guard.instance = Some(instance.clone());

        if let Err(e) = self.apply(&mut guard, AgentEvent::Ready, true).await {
            if let Err(term) = self.runtime.terminate(&instance).await {
                warn!(agent_id = %id, "Failed to tear down rejected agent: {}", term);
            }
            self.remove(&guard);
            return Err(e);
        }

        metrics::counter!("aegis_swarm_agents_spawned_total").increment(1);
        metrics::gauge!("aegis_swarm_live_agents").set(self.live_count() as f64);
        info!(agent_id = %id, role = %guard.profile.role, "Agent '{}' spawned", guard.profile.name);
        Ok(id)
    }

    async fn launch_with_retry(&self, id: AgentId, profile: &AgentProfile) -> SwarmResult<InstanceId> {
        let policy = &self.settings.spawn_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.runtime.launch(id, profile).await {
                Ok(instance) => return Ok(instance),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        agent_id = %id,
                        attempt,
                        "Agent launch failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                    metrics::counter!("aegis_swarm_spawn_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(agent_id = %id, attempt, "Agent launch failed permanently: {}", e);
                    return Err(SwarmError::AgentSpawn {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Apply `event` to one agent, serialized with its other transitions.
    pub async fn transition(&self, id: AgentId, event: AgentEvent) -> SwarmResult<AgentState> {
        let mut guard = self.lock(id).await?;
        self.apply(&mut guard, event, true).await
    }

    /// Apply `event` to an already locked record.
    ///
    /// With `enforce_hooks == false` pre-hooks are still consulted, but a deny
    /// is only logged (crash handling and rollbacks must not be vetoed).
    pub async fn apply(&self, agent: &mut Agent, event: AgentEvent, enforce_hooks: bool) -> SwarmResult<AgentState> {
        let from = agent.state;
        let mut next = agent.clone();
        let to = next.apply(&event, self.settings.max_restarts)?;

        let transition = TransitionEvent {
            agent_id: agent.id,
            event: event.clone(),
            from,
            to,
            at: Utc::now(),
        };

        for hook in &self.hooks {
            if let HookDecision::Deny(reason) = hook.before_transition(&transition).await {
                if enforce_hooks {
                    info!(
                        agent_id = %agent.id,
                        hook = hook.name(),
                        "Transition {} -> {} denied: {}",
                        from,
                        to,
                        reason
                    );
                    metrics::counter!("aegis_swarm_hook_denials_total").increment(1);
                    return Err(SwarmError::HookDenied {
                        hook: hook.name().to_string(),
                        reason,
                    });
                }
                warn!(
                    agent_id = %agent.id,
                    hook = hook.name(),
                    "Ignoring hook denial of mandatory transition {} -> {}: {}",
                    from,
                    to,
                    reason
                );
            }
        }

        match (from.is_live(), to.is_live()) {
            (true, false) => self.free_slot(),
            (false, true) => self.reserve_slot()?,
            _ => {}
        }

        *agent = next;
        debug!(agent_id = %agent.id, "Agent {} -> {} ({})", from, to, event.name());
        metrics::counter!("aegis_swarm_agent_transitions_total", "to" => to.as_str()).increment(1);

        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentTransitioned {
            agent_id: agent.id,
            from,
            to,
            transitioned_at: transition.at,
        });
        match &event {
            AgentEvent::Fail(reason) => {
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentFailed {
                    agent_id: agent.id,
                    reason: reason.clone(),
                    failed_at: transition.at,
                });
            }
            AgentEvent::Restart => {
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentRestarted {
                    agent_id: agent.id,
                    restart_count: agent.restart_count,
                    restarted_at: transition.at,
                });
            }
            _ => {}
        }

        if let Some(tx) = &self.post_hooks {
            if tx.send(transition).is_err() {
                debug!("Post-transition hook worker is gone");
            }
        }
        Ok(to)
    }

    /// `Error → Spawning → Idle` on a locked record, relaunching the runtime.
    pub async fn restart(&self, agent: &mut Agent) -> SwarmResult<AgentState> {
        let stale = agent.instance.clone();
        self.apply(agent, AgentEvent::Restart, false).await?;
        if let Some(stale) = stale {
            if let Err(e) = self.runtime.terminate(&stale).await {
                debug!(agent_id = %agent.id, "Stale instance teardown failed: {}", e);
            }
        }
        match self.launch_with_retry(agent.id, &agent.profile).await {
            Ok(instance) => {
                agent.instance = Some(instance);
                self.apply(agent, AgentEvent::Ready, false).await
            }
            Err(e) => {
                self.apply(agent, AgentEvent::Fail(e.to_string()), false).await?;
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: AgentId) -> SwarmResult<Agent> {
        Ok(self.handle(id)?.lock().await.clone())
    }

    /// Agents matching `filter`, oldest first.
    pub async fn list(&self, filter: &AgentFilter) -> Vec<Agent> {
        let handles: Vec<Arc<Mutex<Agent>>> = self.agents.iter().map(|e| e.value().clone()).collect();
        let mut agents = Vec::with_capacity(handles.len());
        for handle in handles {
            let agent = handle.lock().await;
            if filter.matches(&agent) {
                agents.push(agent.clone());
            }
        }
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    pub async fn heartbeat(&self, id: AgentId) -> SwarmResult<()> {
        self.handle(id)?.lock().await.touch_heartbeat();
        Ok(())
    }

    /// Terminate and remove an agent.
    ///
    /// A graceful termination can be vetoed by a pre-hook; a forced one cannot.
    pub async fn terminate(&self, id: AgentId, graceful: bool) -> SwarmResult<()> {
        let mut guard = self.lock(id).await?;
        self.begin_termination(&mut guard, graceful).await?;
        self.finish_termination(&mut guard).await
    }

    /// First half of termination: move a live agent to `Terminating`.
    pub async fn begin_termination(&self, agent: &mut Agent, graceful: bool) -> SwarmResult<()> {
        match agent.state {
            AgentState::Spawning | AgentState::Idle | AgentState::Busy => {
                self.apply(agent, AgentEvent::Terminate, graceful).await?;
            }
            AgentState::Terminating | AgentState::Terminated | AgentState::Error => {}
        }
        Ok(())
    }

    /// Second half: tear down the runtime, mark `Terminated` and drop the record.
    pub async fn finish_termination(&self, agent: &mut Agent) -> SwarmResult<()> {
        if let Some(instance) = agent.instance.take() {
            if let Err(e) = self.runtime.terminate(&instance).await {
                warn!(agent_id = %agent.id, instance = %instance, "Runtime termination failed: {}", e);
            }
        }
        if agent.state == AgentState::Terminating {
            self.apply(agent, AgentEvent::Terminated, false).await?;
        }
        self.remove(agent);
        info!(agent_id = %agent.id, "Agent '{}' terminated", agent.profile.name);
        Ok(())
    }

    /// Drop a locked record. A still-live record gives back its slot.
    pub fn remove(&self, agent: &Agent) -> bool {
        if self.agents.remove(&agent.id).is_none() {
            return false;
        }
        if agent.state.is_live() {
            self.free_slot();
        }
        metrics::gauge!("aegis_swarm_live_agents").set(self.live_count() as f64);
        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentRemoved {
            agent_id: agent.id,
            removed_at: Utc::now(),
        });
        true
    }

    /// Ids of every registered agent.
    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::infrastructure::runtime::InProcessRuntime;
    use async_trait::async_trait;
    use std::time::Duration;

    fn settings(max_agents: usize) -> RegistrySettings {
        RegistrySettings {
            max_agents,
            max_restarts: 1,
            spawn_retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
        }
    }

    fn registry(max_agents: usize) -> AgentRegistry {
        AgentRegistry::new(
            settings(max_agents),
            Arc::new(InProcessRuntime::new()),
            Vec::new(),
            EventBus::new(64),
        )
    }

    struct DenyBusy;

    #[async_trait]
    impl TransitionHook for DenyBusy {
        fn name(&self) -> &str {
            "deny-busy"
        }

        async fn before_transition(&self, event: &TransitionEvent) -> HookDecision {
            if event.to == AgentState::Busy {
                HookDecision::Deny("busy is forbidden".to_string())
            } else {
                HookDecision::Allow
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_reaches_idle() {
        let registry = registry(2);
        let id = registry.spawn(AgentProfile::new("a1", "coder")).await.unwrap();
        let agent = registry.get(id).await.unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.instance.is_some());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_admission_limit_and_slot_release() {
        let registry = registry(2);
        let a1 = registry.spawn(AgentProfile::new("a1", "coder")).await.unwrap();
        registry.spawn(AgentProfile::new("a2", "coder")).await.unwrap();
        let err = registry.spawn(AgentProfile::new("a3", "coder")).await.unwrap_err();
        assert!(matches!(err, SwarmError::AgentLimit { max: 2 }));

        registry.terminate(a1, true).await.unwrap();
        assert!(registry.get(a1).await.is_err());
        registry.spawn(AgentProfile::new("a3", "coder")).await.unwrap();
        assert_eq!(registry.live_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_spawns_never_exceed_limit() {
        let registry = Arc::new(registry(3));
        let mut handles = Vec::new();
        for i in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.spawn(AgentProfile::new(format!("a{}", i), "coder")).await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(registry.live_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_retries_transient_launch_failures() {
        let runtime = Arc::new(InProcessRuntime::new().with_launch_failures(2));
        let registry = AgentRegistry::new(settings(2), runtime.clone(), Vec::new(), EventBus::new(8));
        registry.spawn(AgentProfile::new("a", "coder")).await.unwrap();
        assert_eq!(runtime.launch_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_gives_up_after_budget() {
        let runtime = Arc::new(InProcessRuntime::new().with_launch_failures(5));
        let registry = AgentRegistry::new(settings(2), runtime, Vec::new(), EventBus::new(8));
        let err = registry.spawn(AgentProfile::new("a", "coder")).await.unwrap_err();
        assert!(matches!(err, SwarmError::AgentSpawn { attempts: 3, .. }));
        assert_eq!(registry.live_count(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pre_hook_denial_blocks_transition() {
        let registry = AgentRegistry::new(
            settings(2),
            Arc::new(InProcessRuntime::new()),
            vec![Arc::new(DenyBusy)],
            EventBus::new(8),
        );
        let id = registry.spawn(AgentProfile::new("a", "coder")).await.unwrap();
        let err = registry
            .transition(id, AgentEvent::Assign(aegis_core::domain::task::TaskId::new()))
            .await
            .unwrap_err();
        match err {
            SwarmError::HookDenied { hook, reason } => {
                assert_eq!(hook, "deny-busy");
                assert_eq!(reason, "busy is forbidden");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(registry.get(id).await.unwrap().state, AgentState::Idle);
    }

    #[tokio::test]
    async fn test_fail_frees_slot_and_restart_reserves_it() {
        let registry = registry(1);
        let id = registry
            .spawn(AgentProfile::new("a", "coder").with_auto_restart(true))
            .await
            .unwrap();
        registry.transition(id, AgentEvent::Fail("crash".into())).await.unwrap();
        assert_eq!(registry.live_count(), 0);

        let mut guard = registry.lock(id).await.unwrap();
        assert_eq!(registry.restart(&mut guard).await.unwrap(), AgentState::Idle);
        assert_eq!(guard.restart_count, 1);
        drop(guard);
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let registry = registry(3);
        registry
            .spawn(AgentProfile::new("a", "coder").with_capability("rust"))
            .await
            .unwrap();
        registry.spawn(AgentProfile::new("b", "reviewer")).await.unwrap();

        let coders = registry
            .list(&AgentFilter {
                role: Some("coder".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(coders.len(), 1);
        let rust = registry
            .list(&AgentFilter {
                capability: Some("rust".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(rust[0].name(), "a");
        assert_eq!(registry.list(&AgentFilter::state(AgentState::Idle)).await.len(), 2);
    }
}
