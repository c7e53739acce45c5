// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle.
///
/// `Queued → Assigned → Running → {Completed, Cancelled, Failed}`; a failed
/// attempt under the retry bound goes back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Assigned,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, target: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Queued)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission request for a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,

    /// Higher runs first
    #[serde(default)]
    pub priority: i32,

    /// Tasks that must be `Completed` before this one is eligible
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        if !self.dependencies.contains(&task_id) {
            self.dependencies.push(task_id);
        }
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub required_capabilities: BTreeSet<String>,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub assigned_agent: Option<AgentId>,
    pub retry_count: u32,
    /// Monotonic admission order; refreshed on every requeue
    pub sequence: u64,
    pub cancel_requested: bool,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            description: spec.description,
            priority: spec.priority,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            payload: spec.payload,
            state: TaskState::Queued,
            assigned_agent: None,
            retry_count: 0,
            sequence,
            cancel_requested: false,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether an agent advertising `capabilities` may run this task.
    pub fn is_runnable_by(&self, capabilities: &BTreeSet<String>) -> bool {
        self.required_capabilities.is_subset(capabilities)
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matching() {
        let task = Task::from_spec(TaskSpec::new("build").requires("rust"), 1);
        let mut caps = BTreeSet::new();
        assert!(!task.is_runnable_by(&caps));
        caps.insert("rust".to_string());
        caps.insert("python".to_string());
        assert!(task.is_runnable_by(&caps));
    }

    #[test]
    fn test_state_machine() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Assigned));
        assert!(TaskState::Running.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Queued.can_transition_to(TaskState::Completed));
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn test_spec_dependencies_deduplicated() {
        let dep = TaskId::new();
        let spec = TaskSpec::new("x").depends_on(dep).depends_on(dep);
        assert_eq!(spec.dependencies, vec![dep]);
    }
}
