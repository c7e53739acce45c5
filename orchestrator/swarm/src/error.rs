// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Error taxonomy for the swarm engine.

use aegis_core::domain::agent::{AgentId, TransitionError};
use aegis_core::domain::swarm::ProposalId;
use aegis_core::domain::task::{TaskId, TaskState};
use thiserror::Error;

pub type SwarmResult<T> = Result<T, SwarmError>;

#[derive(Debug, Clone, Error)]
pub enum SwarmError {
    #[error("Agent limit reached: {max} live agents")]
    AgentLimit { max: usize },

    #[error("Failed to spawn agent after {attempts} attempt(s): {reason}")]
    AgentSpawn { attempts: u32, reason: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Task {task} is {state}; cannot {operation}")]
    InvalidTaskState {
        task: TaskId,
        state: TaskState,
        operation: &'static str,
    },

    #[error("Transition denied by hook '{hook}': {reason}")]
    HookDenied { hook: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Task queue full: {capacity} non-terminal tasks")]
    QueueFull { capacity: usize },

    #[error("Timed out acquiring lock on '{resource}'{}", victim_suffix(.deadlock_victim))]
    LockTimeout { resource: String, deadlock_victim: bool },

    /// The waiting agent was released from the ledger, e.g. after it failed
    #[error("Agent {agent} was evicted while waiting for '{resource}'")]
    LockEvicted { agent: AgentId, resource: String },

    #[error("Agent {agent} does not hold lock on '{resource}'")]
    NotHolder { agent: AgentId, resource: String },

    #[error("Deadlock detected among agents {cycle:?}")]
    DeadlockDetected { cycle: Vec<AgentId> },

    #[error("Proposal {0} timed out before reaching a decision")]
    ConsensusTimeout(ProposalId),

    #[error("Proposal {0} is already decided")]
    LateVote(ProposalId),

    #[error("Agent {agent} is not in the electorate of proposal {proposal}")]
    NotEligible { proposal: ProposalId, agent: AgentId },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("State store error: {0}")]
    Persistence(String),

    #[error("Swarm halted: {0}")]
    SwarmHalted(String),
}

fn victim_suffix(deadlock_victim: &bool) -> &'static str {
    if *deadlock_victim {
        " (deadlock victim)"
    } else {
        ""
    }
}

impl SwarmError {
    pub fn agent_not_found(id: AgentId) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: TaskId) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    pub fn proposal_not_found(id: ProposalId) -> Self {
        Self::NotFound {
            kind: "proposal",
            id: id.to_string(),
        }
    }

    /// Transient failures a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AgentSpawn { .. } | Self::LockTimeout { .. } | Self::ConsensusTimeout(_)
        )
    }

    /// Capacity signals: retry later, not a fault.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::AgentLimit { .. } | Self::QueueFull { .. })
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentLimit { .. } => "agent_limit",
            Self::AgentSpawn { .. } => "agent_spawn",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::InvalidTaskState { .. } => "invalid_task_state",
            Self::HookDenied { .. } => "hook_denied",
            Self::NotFound { .. } => "not_found",
            Self::QueueFull { .. } => "queue_full",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockEvicted { .. } => "lock_evicted",
            Self::NotHolder { .. } => "not_holder",
            Self::DeadlockDetected { .. } => "deadlock_detected",
            Self::ConsensusTimeout(_) => "consensus_timeout",
            Self::LateVote(_) => "late_vote",
            Self::NotEligible { .. } => "not_eligible",
            Self::InvalidTopology(_) => "invalid_topology",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Persistence(_) => "persistence",
            Self::SwarmHalted(_) => "swarm_halted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SwarmError::QueueFull { capacity: 1 }.is_backpressure());
        assert!(SwarmError::AgentLimit { max: 2 }.is_backpressure());
        assert!(!SwarmError::QueueFull { capacity: 1 }.is_retryable());
        assert!(SwarmError::LockTimeout {
            resource: "r".into(),
            deadlock_victim: true
        }
        .is_retryable());
        assert!(!SwarmError::InvariantViolation("x".into()).is_retryable());
        assert!(!SwarmError::LockEvicted {
            agent: AgentId::new(),
            resource: "r".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_lock_timeout_message() {
        let err = SwarmError::LockTimeout {
            resource: "db".into(),
            deadlock_victim: true,
        };
        assert_eq!(err.to_string(), "Timed out acquiring lock on 'db' (deadlock victim)");
    }
}
