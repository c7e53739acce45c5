// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Aggregate
//!
//! An agent is an autonomous worker unit owned by the swarm's agent registry.
//! Its lifecycle is a small state machine:
//!
//! ```text
//! Spawning ──Ready──▶ Idle ──Assign──▶ Busy
//!    │                 ▲ │◀──Release───┘ │
//!    │                 │ └──Terminate──┐ │
//!    └────Terminate────┼──────────────▶ Terminating ──Terminated──▶ Terminated*
//!                      │
//!  any non-terminated ─┴──Fail──▶ Error* ──Restart (budget)──▶ Spawning
//! ```
//!
//! Transitions are pure: [`AgentState::next`] validates an [`AgentEvent`] and
//! [`Agent::apply`] folds the side effects (assigned task, restart count) into
//! the aggregate. Locking and hooks are the registry's concern.

use crate::domain::runtime::InstanceId;
use crate::domain::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared identity of an agent, supplied with the spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Human-readable agent name
    pub name: String,

    /// Declared type/role (e.g. "coder", "reviewer")
    pub role: String,

    /// Capability tags matched against task requirements
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Scheduling priority; the lowest-priority agent is the deadlock victim
    #[serde(default)]
    pub priority: i32,

    /// Restart from `Error` while the swarm's restart budget remains
    #[serde(default)]
    pub auto_restart: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            capabilities: BTreeSet::new(),
            priority: 0,
            auto_restart: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// The lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Runtime is being provisioned
    Spawning,
    /// Ready and waiting for work
    Idle,
    /// Executing an assigned task
    Busy,
    /// Shutdown requested, runtime being torn down
    Terminating,
    /// Runtime torn down; record is about to leave the registry
    Terminated,
    /// Unrecoverable failure (restartable only when the profile allows it)
    Error,
}

impl AgentState {
    /// Live agents count against the swarm's concurrency limit.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Terminated | Self::Error)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }

    /// Validate `event` against the state machine and return the target state.
    ///
    /// Restart budget is not checked here; see [`Agent::apply`].
    pub fn next(self, event: &AgentEvent) -> Result<AgentState, TransitionError> {
        use AgentEvent as E;
        use AgentState as S;

        let target = match (self, event) {
            (S::Spawning, E::Ready) => S::Idle,
            (S::Idle, E::Assign(_)) => S::Busy,
            (S::Busy, E::Release) => S::Idle,
            (S::Spawning | S::Idle | S::Busy, E::Terminate) => S::Terminating,
            (S::Terminating, E::Terminated) => S::Terminated,
            (S::Error, E::Restart) => S::Spawning,
            (from, E::Fail(_)) if from != S::Terminated => S::Error,
            (from, event) => {
                return Err(TransitionError::Invalid {
                    from,
                    event: event.name(),
                })
            }
        };
        Ok(target)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the agent state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Ready,
    Assign(TaskId),
    Release,
    Terminate,
    Terminated,
    Fail(String),
    Restart,
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Assign(_) => "assign",
            Self::Release => "release",
            Self::Terminate => "terminate",
            Self::Terminated => "terminated",
            Self::Fail(_) => "fail",
            Self::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition: cannot apply '{event}' to an agent in state '{from}'")]
    Invalid { from: AgentState, event: &'static str },

    #[error("restart not permitted after {restarts} restart(s) (auto_restart={auto_restart})")]
    RestartNotPermitted { restarts: u32, auto_restart: bool },
}

/// An agent instance tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub profile: AgentProfile,
    pub state: AgentState,
    pub assigned_task: Option<TaskId>,
    pub restart_count: u32,
    pub instance: Option<InstanceId>,
    pub last_error: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(profile: AgentProfile) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            profile,
            state: AgentState::Spawning,
            assigned_task: None,
            restart_count: 0,
            instance: None,
            last_error: None,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn can_restart(&self, max_restarts: u32) -> bool {
        self.profile.auto_restart && self.restart_count < max_restarts
    }

    /// Apply a lifecycle event, returning the new state.
    ///
    /// `max_restarts` bounds `Error → Spawning`; the aggregate is untouched
    /// when the transition is rejected.
    pub fn apply(&mut self, event: &AgentEvent, max_restarts: u32) -> Result<AgentState, TransitionError> {
        let target = self.state.next(event)?;

        match event {
            AgentEvent::Assign(task_id) => self.assigned_task = Some(*task_id),
            AgentEvent::Release | AgentEvent::Terminated => self.assigned_task = None,
            AgentEvent::Fail(reason) => {
                self.assigned_task = None;
                self.last_error = Some(reason.clone());
            }
            AgentEvent::Restart => {
                if !self.can_restart(max_restarts) {
                    return Err(TransitionError::RestartNotPermitted {
                        restarts: self.restart_count,
                        auto_restart: self.profile.auto_restart,
                    });
                }
                self.restart_count += 1;
                self.instance = None;
            }
            AgentEvent::Ready | AgentEvent::Terminate => {}
        }

        self.state = target;
        self.updated_at = Utc::now();
        Ok(target)
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new(AgentProfile::new("worker", "coder").with_capability("rust"))
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut agent = agent();
        let task = TaskId::new();

        assert_eq!(agent.apply(&AgentEvent::Ready, 0).unwrap(), AgentState::Idle);
        assert_eq!(agent.apply(&AgentEvent::Assign(task), 0).unwrap(), AgentState::Busy);
        assert_eq!(agent.assigned_task, Some(task));
        assert_eq!(agent.apply(&AgentEvent::Release, 0).unwrap(), AgentState::Idle);
        assert!(agent.assigned_task.is_none());
        assert_eq!(agent.apply(&AgentEvent::Terminate, 0).unwrap(), AgentState::Terminating);
        assert_eq!(agent.apply(&AgentEvent::Terminated, 0).unwrap(), AgentState::Terminated);
    }

    #[test]
    fn test_invalid_transition_leaves_state_untouched() {
        let mut agent = agent();
        let err = agent.apply(&AgentEvent::Release, 0).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { from: AgentState::Spawning, event: "release" }));
        assert_eq!(agent.state, AgentState::Spawning);
    }

    #[test]
    fn test_terminated_cannot_fail() {
        let mut agent = agent();
        agent.state = AgentState::Terminated;
        assert!(agent.apply(&AgentEvent::Fail("boom".into()), 0).is_err());
    }

    #[test]
    fn test_fail_from_busy_clears_assignment() {
        let mut agent = agent();
        agent.apply(&AgentEvent::Ready, 0).unwrap();
        agent.apply(&AgentEvent::Assign(TaskId::new()), 0).unwrap();
        assert_eq!(agent.apply(&AgentEvent::Fail("crash".into()), 0).unwrap(), AgentState::Error);
        assert!(agent.assigned_task.is_none());
        assert_eq!(agent.last_error.as_deref(), Some("crash"));
    }

    #[test]
    fn test_restart_respects_budget() {
        let mut agent = Agent::new(AgentProfile::new("w", "coder").with_auto_restart(true));
        agent.apply(&AgentEvent::Fail("x".into()), 1).unwrap();
        assert_eq!(agent.apply(&AgentEvent::Restart, 1).unwrap(), AgentState::Spawning);
        assert_eq!(agent.restart_count, 1);

        agent.apply(&AgentEvent::Fail("x".into()), 1).unwrap();
        let err = agent.apply(&AgentEvent::Restart, 1).unwrap_err();
        assert!(matches!(err, TransitionError::RestartNotPermitted { restarts: 1, .. }));
        assert_eq!(agent.state, AgentState::Error);
    }

    #[test]
    fn test_restart_requires_auto_restart() {
        let mut agent = agent();
        agent.apply(&AgentEvent::Fail("x".into()), 5).unwrap();
        assert!(agent.apply(&AgentEvent::Restart, 5).is_err());
    }

    #[test]
    fn test_live_states() {
        assert!(AgentState::Spawning.is_live());
        assert!(AgentState::Busy.is_live());
        assert!(AgentState::Terminating.is_live());
        assert!(!AgentState::Terminated.is_live());
        assert!(!AgentState::Error.is_live());
    }
}
