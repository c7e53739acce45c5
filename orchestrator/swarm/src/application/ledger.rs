// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Ledger
//!
//! Exclusive, FIFO-fair resource locks for agents, with wait-for graph
//! deadlock detection.
//!
//! Each resource has its own entry (a `parking_lot` mutex plus a `Notify`);
//! there is no ledger-wide lock. The `held` and `waiting` indexes are only
//! written while the owning entry is locked, which is what [`ResourceLedger::verify`]
//! relies on.
//!
//! Lock order: entry state, then index maps. Never lock an entry while
//! holding a `DashMap` reference.

use crate::domain::lock::ResourceLock;
use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::events::LockEvent;
use aegis_core::infrastructure::event_bus::EventBus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
struct Holder {
    agent: AgentId,
    since: Instant,
    acquired_at: DateTime<Utc>,
}

/// Why a waiter was removed from a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    DeadlockVictim,
    /// The agent was released wholesale (lost, cancelled or ledger reset)
    Released,
}

impl Eviction {
    fn into_error(self, agent: AgentId, resource: &str) -> SwarmError {
        match self {
            Eviction::DeadlockVictim => SwarmError::LockTimeout {
                resource: resource.to_string(),
                deadlock_victim: true,
            },
            Eviction::Released => SwarmError::LockEvicted {
                agent,
                resource: resource.to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Holder>,
    wait_queue: VecDeque<AgentId>,
    evicted: HashMap<AgentId, Eviction>,
}

#[derive(Default)]
struct LockEntry {
    state: Mutex<LockState>,
    notify: Notify,
}

/// A cycle broken by [`ResourceLedger::resolve_deadlocks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockResolution {
    /// `cycle[i]` waits on a resource held by `cycle[i + 1]`
    pub cycle: Vec<AgentId>,
    pub victim: AgentId,
    /// The victim's lock that was force-released
    pub resource: String,
}

/// Wait-for edge: waiter → (holder, resource)
type WaitForGraph = BTreeMap<AgentId, (AgentId, String)>;

pub struct ResourceLedger {
    entries: DashMap<String, Arc<LockEntry>>,
    held: DashMap<AgentId, BTreeSet<String>>,
    waiting: DashMap<AgentId, String>,
    priorities: DashMap<AgentId, i32>,
    event_bus: EventBus,
}

/// Removes a cancelled `acquire` from the wait queue.
struct Waiter<'a> {
    ledger: &'a ResourceLedger,
    entry: &'a LockEntry,
    resource: &'a str,
    agent: AgentId,
    done: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.entry.state.lock();
        state.wait_queue.retain(|a| *a != self.agent);
        state.evicted.remove(&self.agent);
        self.ledger.clear_waiting(self.agent, self.resource);
        if state.holder.is_none() {
            self.entry.notify.notify_waiters();
        }
    }
}

impl ResourceLedger {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            held: DashMap::new(),
            waiting: DashMap::new(),
            priorities: DashMap::new(),
            event_bus,
        }
    }

    fn entry(&self, resource: &str) -> Arc<LockEntry> {
        self.entries
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(LockEntry::default()))
            .value()
            .clone()
    }

    fn existing(&self, resource: &str) -> Option<Arc<LockEntry>> {
        self.entries.get(resource).map(|e| e.value().clone())
    }

    fn clear_waiting(&self, agent: AgentId, resource: &str) {
        self.waiting.remove_if(&agent, |_, r| r == resource);
    }

    fn unindex(&self, agent: AgentId, resource: &str) {
        let empty = match self.held.get_mut(&agent) {
            Some(mut resources) => {
                resources.remove(resource);
                resources.is_empty()
            }
            None => false,
        };
        if empty {
            self.held.remove_if(&agent, |_, resources| resources.is_empty());
        }
    }

    /// Caller holds the entry lock.
    fn grant(&self, state: &mut LockState, resource: &str, agent: AgentId) {
        let acquired_at = Utc::now();
        state.holder = Some(Holder {
            agent,
            since: Instant::now(),
            acquired_at,
        });
        self.held.entry(agent).or_default().insert(resource.to_string());
        debug!(agent_id = %agent, resource, "Lock acquired");
        metrics::counter!("aegis_swarm_lock_acquisitions_total").increment(1);
        self.event_bus.publish_lock_event(LockEvent::LockAcquired {
            resource_id: resource.to_string(),
            agent_id: agent,
            acquired_at,
        });
    }

    fn check_lock_order(&self, agent: AgentId, resource: &str) {
        let violation = self.held.get(&agent).and_then(|held| {
            let highest = held.iter().next_back()?;
            (resource < highest.as_str() && !held.contains(resource)).then(|| highest.clone())
        });
        if let Some(highest) = violation {
            warn!(
                agent_id = %agent,
                resource,
                held = %highest,
                "Lock acquired out of order; ascending order avoids deadlocks"
            );
            metrics::counter!("aegis_swarm_lock_order_violations_total").increment(1);
        }
    }

    /// Acquire `resource` for `agent`, waiting in FIFO order up to `timeout`.
    /// Acquiring a lock the agent already holds succeeds immediately.
    pub async fn acquire(&self, agent: AgentId, resource: &str, timeout: Duration) -> SwarmResult<()> {
        self.acquire_until(agent, resource, Instant::now() + timeout).await
    }

    async fn acquire_until(&self, agent: AgentId, resource: &str, deadline: Instant) -> SwarmResult<()> {
        self.check_lock_order(agent, resource);
        let entry = self.entry(resource);

        {
            let mut state = entry.state.lock();
            let holder = state.holder.as_ref().map(|h| h.agent);
            if holder == Some(agent) {
                return Ok(());
            }
            if holder.is_none() && state.wait_queue.is_empty() {
                self.grant(&mut state, resource, agent);
                return Ok(());
            }
            if !state.wait_queue.contains(&agent) {
                state.wait_queue.push_back(agent);
            }
            self.waiting.insert(agent, resource.to_string());
        }
        debug!(agent_id = %agent, resource, "Waiting for lock");

        let mut waiter = Waiter {
            ledger: self,
            entry: &entry,
            resource,
            agent,
            done: false,
        };

        loop {
            let notified = entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let timed_out = {
                let mut state = entry.state.lock();
                if let Some(outcome) = self.poll_grant(&mut state, resource, agent) {
                    waiter.done = true;
                    return outcome;
                }
                Instant::now() >= deadline
            };
            if timed_out || tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = entry.state.lock();
                if let Some(outcome) = self.poll_grant(&mut state, resource, agent) {
                    waiter.done = true;
                    return outcome;
                }
                let eviction = state.evicted.remove(&agent);
                state.wait_queue.retain(|a| *a != agent);
                self.clear_waiting(agent, resource);
                if state.holder.is_none() {
                    entry.notify.notify_waiters();
                }
                waiter.done = true;
                if let Some(eviction) = eviction {
                    return Err(eviction.into_error(agent, resource));
                }
                warn!(agent_id = %agent, resource, "Lock acquisition timed out");
                metrics::counter!("aegis_swarm_lock_timeouts_total").increment(1);
                return Err(SwarmError::LockTimeout {
                    resource: resource.to_string(),
                    deadlock_victim: false,
                });
            }
        }
    }

    /// Grant if `agent` is at the head of a free lock, or report its eviction.
    fn poll_grant(&self, state: &mut LockState, resource: &str, agent: AgentId) -> Option<SwarmResult<()>> {
        if let Some(eviction) = state.evicted.remove(&agent) {
            self.clear_waiting(agent, resource);
            return Some(Err(eviction.into_error(agent, resource)));
        }
        if state.holder.is_none() && state.wait_queue.front() == Some(&agent) {
            state.wait_queue.pop_front();
            self.clear_waiting(agent, resource);
            self.grant(state, resource, agent);
            return Some(Ok(()));
        }
        None
    }

    /// Acquire every resource in ascending order. On failure the locks taken
    /// by this call are released again.
    pub async fn acquire_all(&self, agent: AgentId, resources: &[String], timeout: Duration) -> SwarmResult<()> {
        let ordered: BTreeSet<&String> = resources.iter().collect();
        let already: BTreeSet<String> = self.held_by(agent).into_iter().collect();
        let deadline = Instant::now() + timeout;

        let mut taken: Vec<String> = Vec::new();
        for resource in ordered {
            if let Err(e) = self.acquire_until(agent, resource, deadline).await {
                for acquired in taken.iter().rev() {
                    if let Err(release_err) = self.release(agent, acquired) {
                        warn!(agent_id = %agent, resource = %acquired, "Rollback release failed: {}", release_err);
                    }
                }
                return Err(e);
            }
            if !already.contains(resource) {
                taken.push(resource.clone());
            }
        }
        Ok(())
    }

    pub fn release(&self, agent: AgentId, resource: &str) -> SwarmResult<()> {
        let not_holder = || SwarmError::NotHolder {
            agent,
            resource: resource.to_string(),
        };
        let entry = self.existing(resource).ok_or_else(not_holder)?;
        {
            let mut state = entry.state.lock();
            if state.holder.as_ref().map(|h| h.agent) != Some(agent) {
                return Err(not_holder());
            }
            state.holder = None;
            self.unindex(agent, resource);
        }
        entry.notify.notify_waiters();

        debug!(agent_id = %agent, resource, "Lock released");
        self.event_bus.publish_lock_event(LockEvent::LockReleased {
            resource_id: resource.to_string(),
            agent_id: agent,
            released_at: Utc::now(),
        });
        Ok(())
    }

    /// Release everything `agent` holds and evict it from any wait queue.
    /// An evicted `acquire` fails with `LockEvicted`. Returns the released
    /// resources.
    pub fn release_all(&self, agent: AgentId, reason: &str) -> Vec<String> {
        if let Some((_, resource)) = self.waiting.remove(&agent) {
            if let Some(entry) = self.existing(&resource) {
                let mut state = entry.state.lock();
                if state.wait_queue.contains(&agent) {
                    state.wait_queue.retain(|a| *a != agent);
                    state.evicted.insert(agent, Eviction::Released);
                }
                drop(state);
                entry.notify.notify_waiters();
            }
        }

        // The index entry is cleared per resource under its entry lock
        let resources = self.held_by(agent);
        let mut released = Vec::with_capacity(resources.len());
        for resource in resources {
            if self.force_release(agent, &resource, reason) {
                released.push(resource);
            }
        }
        released
    }

    /// Clear `agent`'s hold on `resource` regardless of who asked.
    fn force_release(&self, agent: AgentId, resource: &str, reason: &str) -> bool {
        let Some(entry) = self.existing(resource) else {
            return false;
        };
        {
            let mut state = entry.state.lock();
            if state.holder.as_ref().map(|h| h.agent) != Some(agent) {
                return false;
            }
            state.holder = None;
            self.unindex(agent, resource);
        }
        entry.notify.notify_waiters();

        warn!(agent_id = %agent, resource, reason, "Lock force-released");
        metrics::counter!("aegis_swarm_lock_force_releases_total").increment(1);
        self.event_bus.publish_lock_event(LockEvent::LockForceReleased {
            resource_id: resource.to_string(),
            agent_id: agent,
            reason: reason.to_string(),
            released_at: Utc::now(),
        });
        true
    }

    /// Drop all of `agent`'s locks and bookkeeping.
    pub fn forget(&self, agent: AgentId, reason: &str) -> Vec<String> {
        let released = self.release_all(agent, reason);
        self.priorities.remove(&agent);
        released
    }

    pub fn holder(&self, resource: &str) -> Option<ResourceLock> {
        let entry = self.existing(resource)?;
        let state = entry.state.lock();
        let holder = state.holder.as_ref()?;
        Some(ResourceLock {
            resource_id: resource.to_string(),
            held_by: holder.agent,
            acquired_at: holder.acquired_at,
            waiters: state.wait_queue.iter().copied().collect(),
        })
    }

    /// Resources held by `agent`, ascending.
    pub fn held_by(&self, agent: AgentId) -> Vec<String> {
        self.held
            .get(&agent)
            .map(|resources| resources.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn held_count(&self) -> usize {
        self.held.iter().map(|entry| entry.value().len()).sum()
    }

    /// Lower values lose deadlock tie-breaks.
    pub fn set_priority(&self, agent: AgentId, priority: i32) {
        self.priorities.insert(agent, priority);
    }

    fn priority(&self, agent: AgentId) -> i32 {
        self.priorities.get(&agent).map(|p| *p).unwrap_or(0)
    }

    fn wait_for_graph(&self) -> WaitForGraph {
        let waiting: Vec<(AgentId, String)> = self
            .waiting
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut graph = WaitForGraph::new();
        for (waiter, resource) in waiting {
            let Some(entry) = self.existing(&resource) else {
                continue;
            };
            let state = entry.state.lock();
            if !state.wait_queue.contains(&waiter) {
                continue;
            }
            if let Some(holder) = &state.holder {
                if holder.agent != waiter {
                    graph.insert(waiter, (holder.agent, resource));
                }
            }
        }
        graph
    }

    /// First wait-for cycle, visiting agents in ascending id order.
    pub fn detect_deadlock(&self) -> Option<Vec<AgentId>> {
        find_cycle(&self.wait_for_graph())
    }

    /// Break every wait-for cycle by force-releasing one lock per cycle.
    pub fn resolve_deadlocks(&self) -> Vec<DeadlockResolution> {
        let mut resolutions = Vec::new();
        // Each pass removes at least one edge
        let max_passes = self.waiting.len() + 1;
        for _ in 0..max_passes {
            let graph = self.wait_for_graph();
            let Some(cycle) = find_cycle(&graph) else {
                break;
            };
            if let Some(resolution) = self.break_cycle(&graph, cycle) {
                resolutions.push(resolution);
            }
        }
        resolutions
    }

    fn break_cycle(&self, graph: &WaitForGraph, cycle: Vec<AgentId>) -> Option<DeadlockResolution> {
        // cycle[i] waits on the lock cycle[i + 1] holds
        let n = cycle.len();
        let mut candidates = Vec::with_capacity(n);
        for (i, agent) in cycle.iter().enumerate() {
            let predecessor = cycle[(i + n - 1) % n];
            let (_, resource) = graph.get(&predecessor)?;
            let since = self.existing(resource).and_then(|entry| {
                let state = entry.state.lock();
                state.holder.as_ref().filter(|h| h.agent == *agent).map(|h| h.since)
            })?;
            candidates.push((self.priority(*agent), since, *agent, resource.clone()));
        }
        let (_, _, victim, resource) = candidates.into_iter().min()?;

        error!(
            cycle = ?cycle,
            victim = %victim,
            resource = %resource,
            "Deadlock detected; force-releasing victim's lock"
        );
        metrics::counter!("aegis_swarm_deadlocks_total").increment(1);
        self.event_bus.publish_lock_event(LockEvent::DeadlockDetected {
            cycle: cycle.clone(),
            victim,
            resource_id: resource.clone(),
            detected_at: Utc::now(),
        });

        // The victim stops waiting so its caller sees the deadlock
        if let Some((_, waited)) = graph.get(&victim) {
            if let Some(entry) = self.existing(waited) {
                let mut state = entry.state.lock();
                if state.wait_queue.contains(&victim) {
                    state.wait_queue.retain(|a| *a != victim);
                    state.evicted.insert(victim, Eviction::DeadlockVictim);
                }
                drop(state);
                entry.notify.notify_waiters();
            }
        }
        if !self.force_release(victim, &resource, "deadlock victim") {
            return None;
        }
        Some(DeadlockResolution {
            cycle,
            victim,
            resource,
        })
    }

    /// Check holder/index consistency.
    pub fn verify(&self) -> SwarmResult<()> {
        let entries: Vec<(String, Arc<LockEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (resource, entry) in &entries {
            let state = entry.state.lock();
            let mut seen = HashSet::new();
            if let Some(dup) = state.wait_queue.iter().find(|a| !seen.insert(**a)) {
                return Err(SwarmError::InvariantViolation(format!(
                    "agent {} queued twice for '{}'",
                    dup, resource
                )));
            }
            if let Some(holder) = &state.holder {
                if state.wait_queue.contains(&holder.agent) {
                    return Err(SwarmError::InvariantViolation(format!(
                        "holder {} of '{}' is also waiting for it",
                        holder.agent, resource
                    )));
                }
                let indexed = self
                    .held
                    .get(&holder.agent)
                    .is_some_and(|held| held.contains(resource));
                if !indexed {
                    return Err(SwarmError::InvariantViolation(format!(
                        "lock on '{}' held by {} is missing from the holder index",
                        resource, holder.agent
                    )));
                }
            }
        }

        let indexed: Vec<(AgentId, Vec<String>)> = self
            .held
            .iter()
            .map(|e| (*e.key(), e.value().iter().cloned().collect()))
            .collect();
        for (agent, resources) in indexed {
            for resource in resources {
                let consistent = match self.existing(&resource) {
                    Some(entry) => {
                        let state = entry.state.lock();
                        let holds = state.holder.as_ref().is_some_and(|h| h.agent == agent);
                        // Re-read under the entry lock; a release may have raced the snapshot
                        holds
                            || !self
                                .held
                                .get(&agent)
                                .is_some_and(|held| held.contains(&resource))
                    }
                    None => false,
                };
                if !consistent {
                    return Err(SwarmError::InvariantViolation(format!(
                        "index records {} holding '{}' but the lock disagrees",
                        agent, resource
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop every lock and evict every waiter.
    pub fn reset(&self) {
        let entries: Vec<Arc<LockEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let mut state = entry.state.lock();
            state.holder = None;
            let waiters: Vec<AgentId> = state.wait_queue.drain(..).collect();
            for agent in waiters {
                state.evicted.insert(agent, Eviction::Released);
            }
            drop(state);
            entry.notify.notify_waiters();
        }
        self.held.clear();
        self.waiting.clear();
        self.entries.clear();
        warn!("Resource ledger reset");
    }

    #[cfg(test)]
    pub(crate) fn corrupt_index(&self, agent: AgentId, resource: &str) {
        self.held.entry(agent).or_default().insert(resource.to_string());
    }
}

/// DFS over the wait-for graph with visiting (on the current path) and
/// visited sets. Out-degree is at most one since an agent waits on one lock.
fn find_cycle(graph: &WaitForGraph) -> Option<Vec<AgentId>> {
    let mut visited: HashSet<AgentId> = HashSet::new();
    for start in graph.keys() {
        if visited.contains(start) {
            continue;
        }
        let mut path: Vec<AgentId> = Vec::new();
        let mut visiting: HashMap<AgentId, usize> = HashMap::new();
        let mut node = *start;
        loop {
            if let Some(&index) = visiting.get(&node) {
                return Some(path[index..].to_vec());
            }
            if !visited.insert(node) {
                break;
            }
            visiting.insert(node, path.len());
            path.push(node);
            match graph.get(&node) {
                Some((holder, _)) => node = *holder,
                None => break,
            }
        }
    }
    None
}
