// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Queue
//!
//! Priority-ordered admission and dispatch of tasks.
//!
//! **Ordering**: among `Queued` tasks whose dependencies are all `Completed`
//! and whose capability requirements the agent satisfies, the highest
//! priority wins; ties go to the lowest sequence number. Failed attempts
//! re-enter with a fresh sequence number at their original priority, so a
//! repeatedly failing task cannot starve newer work of the same priority.
//!
//! **Admission**: `submit` rejects with `QueueFull` once the non-terminal task
//! count reaches capacity.

use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::task::{Task, TaskId, TaskSpec, TaskState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type ReadyKey = (Reverse<i32>, u64, TaskId);

fn ready_key(task: &Task) -> ReadyKey {
    (Reverse(task.priority), task.sequence, task.id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { retry_count: u32 },
    /// Retry budget exhausted; dependents were cancelled
    DeadLettered {
        retry_count: u32,
        cancelled_dependents: Vec<TaskId>,
    },
    /// Cancellation was already requested, so the failure ends the task
    Cancelled(Cancellation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub task_id: TaskId,
    /// Agent that was assigned when the task was cancelled
    pub agent: Option<AgentId>,
    /// Dependents cancelled transitively
    pub cascaded: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(Cancellation),
    /// Running; the agent has been asked to stop
    Pending { agent: AgentId },
    AlreadyTerminal(TaskState),
}

/// What happened to a task when its agent went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Counted as a failed attempt
    Retried(FailOutcome),
    /// Returned to the queue without consuming an attempt
    Released,
    /// A pending cancellation was completed
    Cancelled(Cancellation),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn active(&self) -> usize {
        self.queued + self.assigned + self.running
    }
}

#[derive(Default)]
struct QueueInner {
    tasks: HashMap<TaskId, Task>,
    ready: BTreeSet<ReadyKey>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    next_sequence: u64,
    active: usize,
}

impl QueueInner {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.state == TaskState::Completed)
        })
    }

    fn task_mut(&mut self, id: TaskId) -> SwarmResult<&mut Task> {
        self.tasks.get_mut(&id).ok_or_else(|| SwarmError::task_not_found(id))
    }

    /// Back to `Queued` behind everything already waiting at its priority.
    fn requeue(&mut self, id: TaskId) {
        let sequence = self.next_sequence();
        if let Some(task) = self.tasks.get_mut(&id) {
            task.set_state(TaskState::Queued);
            task.assigned_agent = None;
            task.cancel_requested = false;
            task.sequence = sequence;
            let key = ready_key(task);
            self.ready.insert(key);
        }
    }

    /// Enter a terminal state; returns the dependents cancelled as a consequence.
    fn settle(&mut self, id: TaskId, state: TaskState) -> Vec<TaskId> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Vec::new();
        };
        if task.state.is_terminal() {
            return Vec::new();
        }
        let key = ready_key(task);
        task.set_state(state);
        self.ready.remove(&key);
        self.active = self.active.saturating_sub(1);

        if state == TaskState::Completed {
            Vec::new()
        } else {
            self.cascade_cancel(id)
        }
    }

    fn cascade_cancel(&mut self, root: TaskId) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut stack: Vec<(TaskId, TaskId)> = self
            .dependents
            .get(&root)
            .map(|deps| deps.iter().map(|d| (*d, root)).collect())
            .unwrap_or_default();

        while let Some((id, upstream)) = stack.pop() {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.state != TaskState::Queued {
                continue;
            }
            let key = ready_key(task);
            task.set_state(TaskState::Cancelled);
            task.last_error = Some(format!("dependency {} will not complete", upstream));
            self.ready.remove(&key);
            self.active = self.active.saturating_sub(1);
            cancelled.push(id);
            if let Some(deps) = self.dependents.get(&id) {
                stack.extend(deps.iter().map(|d| (*d, id)));
            }
        }
        cancelled.sort();
        cancelled
    }

    fn fail(&mut self, id: TaskId, error: &str, max_retries: u32) -> SwarmResult<FailOutcome> {
        let task = self.task_mut(id)?;
        if !matches!(task.state, TaskState::Assigned | TaskState::Running) {
            return Err(SwarmError::InvalidTaskState {
                task: id,
                state: task.state,
                operation: "fail",
            });
        }
        task.last_error = Some(error.to_string());
        if task.cancel_requested {
            debug!(task_id = %id, "Task stopped during requested cancellation: {}", error);
            return Ok(FailOutcome::Cancelled(self.cancel_now(id)));
        }
        task.retry_count += 1;
        let retry_count = task.retry_count;

        if retry_count < max_retries {
            self.requeue(id);
            debug!(task_id = %id, retry_count, "Task requeued after failure: {}", error);
            Ok(FailOutcome::Requeued { retry_count })
        } else {
            let cancelled_dependents = self.settle(id, TaskState::Failed);
            warn!(
                task_id = %id,
                retry_count,
                dependents = cancelled_dependents.len(),
                "Task dead-lettered: {}",
                error
            );
            Ok(FailOutcome::DeadLettered {
                retry_count,
                cancelled_dependents,
            })
        }
    }

    /// Cancel queued tasks whose dependencies are dead or unknown, and their
    /// dependents in turn.
    fn cancel_unrunnable(&mut self) -> Vec<TaskId> {
        let mut roots: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Failed | TaskState::Cancelled))
            .map(|t| (t.sequence, t.id))
            .collect();
        roots.sort();

        let mut cancelled = Vec::new();
        for (_, root) in roots {
            cancelled.extend(self.cascade_cancel(root));
        }

        let mut orphans: Vec<(u64, TaskId, TaskId)> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .filter_map(|t| {
                t.dependencies
                    .iter()
                    .find(|dep| !self.tasks.contains_key(dep))
                    .map(|missing| (t.sequence, t.id, *missing))
            })
            .collect();
        orphans.sort();
        for (_, id, missing) in orphans {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            // Already reached through another orphan's cascade
            if task.state != TaskState::Queued {
                continue;
            }
            task.last_error = Some(format!("dependency {} is unknown", missing));
            cancelled.push(id);
            cancelled.extend(self.settle(id, TaskState::Cancelled));
        }
        cancelled.sort();
        cancelled
    }

    fn cancel_now(&mut self, id: TaskId) -> Cancellation {
        let agent = self.tasks.get(&id).and_then(|t| t.assigned_agent);
        let cascaded = self.settle(id, TaskState::Cancelled);
        Cancellation {
            task_id: id,
            agent,
            cascaded,
        }
    }
}

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    changed: Notify,
    capacity: usize,
    max_retries: u32,
}

impl TaskQueue {
    pub fn new(capacity: usize, max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            changed: Notify::new(),
            capacity,
            max_retries,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-terminal task count
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    /// Resolves the next time the eligible set may have grown.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    fn notify(&self) {
        self.changed.notify_waiters();
    }

    pub fn submit(&self, spec: TaskSpec) -> SwarmResult<Task> {
        let task = {
            let mut inner = self.inner.lock();
            if inner.active >= self.capacity {
                metrics::counter!("aegis_swarm_queue_rejections_total").increment(1);
                return Err(SwarmError::QueueFull {
                    capacity: self.capacity,
                });
            }
            for dep in &spec.dependencies {
                match inner.tasks.get(dep) {
                    None => return Err(SwarmError::task_not_found(*dep)),
                    Some(t) if matches!(t.state, TaskState::Failed | TaskState::Cancelled) => {
                        return Err(SwarmError::InvalidTaskState {
                            task: *dep,
                            state: t.state,
                            operation: "be depended on",
                        })
                    }
                    Some(_) => {}
                }
            }

            let sequence = inner.next_sequence();
            let task = Task::from_spec(spec, sequence);
            for dep in &task.dependencies {
                inner.dependents.entry(*dep).or_default().push(task.id);
            }
            inner.ready.insert(ready_key(&task));
            inner.tasks.insert(task.id, task.clone());
            inner.active += 1;
            metrics::gauge!("aegis_swarm_queue_depth").set(inner.active as f64);
            task
        };
        self.notify();
        debug!(task_id = %task.id, priority = task.priority, sequence = task.sequence, "Task submitted");
        Ok(task)
    }

    /// Assign the best eligible task to `agent`.
    pub fn next(&self, agent: AgentId, capabilities: &BTreeSet<String>) -> Option<Task> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = inner
            .ready
            .iter()
            .find(|(_, _, id)| {
                inner
                    .tasks
                    .get(id)
                    .is_some_and(|t| t.is_runnable_by(capabilities) && inner.dependencies_met(t))
            })
            .copied()?;

        inner.ready.remove(&key);
        let task = inner.tasks.get_mut(&key.2)?;
        task.set_state(TaskState::Assigned);
        task.assigned_agent = Some(agent);
        Some(task.clone())
    }

    /// Like [`Self::next`], waiting up to `timeout` for a task to become eligible.
    pub async fn next_blocking(
        &self,
        agent: AgentId,
        capabilities: &BTreeSet<String>,
        timeout: Duration,
    ) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.next(agent, capabilities) {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// `Assigned → Running`
    pub fn start(&self, id: TaskId) -> SwarmResult<Task> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.state != TaskState::Assigned {
            return Err(SwarmError::InvalidTaskState {
                task: id,
                state: task.state,
                operation: "start",
            });
        }
        task.set_state(TaskState::Running);
        Ok(task.clone())
    }

    /// Mark a running task `Completed`. Returns `false` if it already was.
    pub fn complete(&self, id: TaskId, result: serde_json::Value) -> SwarmResult<bool> {
        {
            let mut inner = self.inner.lock();
            let task = inner.task_mut(id)?;
            match task.state {
                TaskState::Completed => return Ok(false),
                TaskState::Running => {}
                state => {
                    return Err(SwarmError::InvalidTaskState {
                        task: id,
                        state,
                        operation: "complete",
                    })
                }
            }
            task.result = Some(result);
            inner.settle(id, TaskState::Completed);
            metrics::gauge!("aegis_swarm_queue_depth").set(inner.active as f64);
        }
        // Dependents may now be eligible
        self.notify();
        Ok(true)
    }

    pub fn fail(&self, id: TaskId, error: &str) -> SwarmResult<FailOutcome> {
        let outcome = self.inner.lock().fail(id, error, self.max_retries)?;
        if matches!(outcome, FailOutcome::Requeued { .. }) {
            self.notify();
        }
        Ok(outcome)
    }

    /// Cancel a task. Running tasks are only flagged; see [`Self::acknowledge_cancel`].
    pub fn cancel(&self, id: TaskId) -> SwarmResult<CancelOutcome> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        match task.state {
            TaskState::Queued | TaskState::Assigned => Ok(CancelOutcome::Cancelled(inner.cancel_now(id))),
            TaskState::Running => {
                task.cancel_requested = true;
                let agent = task.assigned_agent.ok_or_else(|| {
                    SwarmError::InvariantViolation(format!("running task {} has no assigned agent", id))
                })?;
                Ok(CancelOutcome::Pending { agent })
            }
            state => Ok(CancelOutcome::AlreadyTerminal(state)),
        }
    }

    /// The agent stopped a task whose cancellation was requested.
    pub fn acknowledge_cancel(&self, id: TaskId) -> SwarmResult<Cancellation> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.state != TaskState::Running || !task.cancel_requested {
            return Err(SwarmError::InvalidTaskState {
                task: id,
                state: task.state,
                operation: "acknowledge cancellation",
            });
        }
        Ok(inner.cancel_now(id))
    }

    /// Grace period over: cancel if the request is still outstanding.
    pub fn force_cancel(&self, id: TaskId) -> Option<Cancellation> {
        let mut inner = self.inner.lock();
        let task = inner.tasks.get(&id)?;
        if task.state != TaskState::Running || !task.cancel_requested {
            return None;
        }
        Some(inner.cancel_now(id))
    }

    /// Roll an assignment back, keeping the task's place in line.
    pub fn unassign(&self, id: TaskId) -> SwarmResult<()> {
        {
            let mut inner = self.inner.lock();
            let task = inner.task_mut(id)?;
            if task.state != TaskState::Assigned {
                return Err(SwarmError::InvalidTaskState {
                    task: id,
                    state: task.state,
                    operation: "unassign",
                });
            }
            task.set_state(TaskState::Queued);
            task.assigned_agent = None;
            let key = ready_key(task);
            inner.ready.insert(key);
        }
        self.notify();
        Ok(())
    }

    /// Settle every task held by `agent`.
    ///
    /// With `count_attempt` the loss is treated as a failed attempt, so a task
    /// that keeps killing its agents is eventually dead-lettered.
    pub fn requeue_for_agent(&self, agent: AgentId, reason: &str, count_attempt: bool) -> Vec<(TaskId, Settlement)> {
        let settled = {
            let mut inner = self.inner.lock();
            let mut held: Vec<(u64, TaskId)> = inner
                .tasks
                .values()
                .filter(|t| {
                    t.assigned_agent == Some(agent) && matches!(t.state, TaskState::Assigned | TaskState::Running)
                })
                .map(|t| (t.sequence, t.id))
                .collect();
            held.sort();

            let mut settled = Vec::with_capacity(held.len());
            for (_, id) in held {
                let cancel_requested = inner.tasks.get(&id).is_some_and(|t| t.cancel_requested);
                let settlement = if cancel_requested {
                    Settlement::Cancelled(inner.cancel_now(id))
                } else if count_attempt {
                    match inner.fail(id, reason, self.max_retries) {
                        Ok(outcome) => Settlement::Retried(outcome),
                        Err(e) => {
                            warn!(task_id = %id, "Could not settle task of lost agent: {}", e);
                            continue;
                        }
                    }
                } else {
                    inner.requeue(id);
                    Settlement::Released
                };
                settled.push((id, settlement));
            }
            settled
        };
        if !settled.is_empty() {
            self.notify();
        }
        settled
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().tasks.get(&id).cloned()
    }

    /// Tasks in submission order, optionally filtered by state.
    pub fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| state.map_or(true, |s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        tasks
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats {
            capacity: self.capacity,
            ..Default::default()
        };
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Assigned => stats.assigned += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
                TaskState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Load tasks recovered from a state store.
    ///
    /// Assigned and running tasks lost their agents with the previous process
    /// and go back to the queue; a pending cancellation completes instead.
    /// Queued tasks that can no longer run (a dependency ended `Failed` or
    /// `Cancelled`, or is missing from the snapshot) are cancelled.
    /// Capacity is not enforced here so recovery never drops work.
    pub fn restore(&self, mut tasks: Vec<Task>) -> usize {
        tasks.sort_by_key(|t| t.sequence);
        let restored = {
            let mut inner = self.inner.lock();
            let highest = tasks.iter().map(|t| t.sequence).max().unwrap_or(0);
            inner.next_sequence = inner.next_sequence.max(highest);

            let mut restored = 0;
            for mut task in tasks {
                if inner.tasks.contains_key(&task.id) {
                    continue;
                }
                if matches!(task.state, TaskState::Assigned | TaskState::Running) {
                    task.assigned_agent = None;
                    if task.cancel_requested {
                        task.set_state(TaskState::Cancelled);
                    } else {
                        task.sequence = inner.next_sequence();
                        task.set_state(TaskState::Queued);
                    }
                }
                for dep in &task.dependencies {
                    inner.dependents.entry(*dep).or_default().push(task.id);
                }
                if !task.state.is_terminal() {
                    inner.active += 1;
                }
                if task.state == TaskState::Queued {
                    inner.ready.insert(ready_key(&task));
                }
                inner.tasks.insert(task.id, task);
                restored += 1;
            }
            let cancelled = inner.cancel_unrunnable();
            if !cancelled.is_empty() {
                warn!(cancelled = cancelled.len(), "Restored tasks cancelled: dependencies will not complete");
            }
            if inner.active > self.capacity {
                warn!(
                    active = inner.active,
                    capacity = self.capacity,
                    "Restored queue exceeds capacity; new submissions will be rejected until it drains"
                );
            }
            restored
        };
        self.notify();
        info!(restored, "Task queue restored");
        restored
    }
}
