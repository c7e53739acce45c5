// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::agent::{AgentId, AgentState};
use crate::domain::swarm::{ProposalId, SwarmId};
use crate::domain::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentLifecycleEvent {
    AgentSpawned {
        agent_id: AgentId,
        name: String,
        role: String,
        spawned_at: DateTime<Utc>,
    },
    AgentTransitioned {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
        transitioned_at: DateTime<Utc>,
    },
    AgentHeartbeatMissed {
        agent_id: AgentId,
        last_heartbeat: DateTime<Utc>,
        detected_at: DateTime<Utc>,
    },
    AgentRestarted {
        agent_id: AgentId,
        restart_count: u32,
        restarted_at: DateTime<Utc>,
    },
    AgentFailed {
        agent_id: AgentId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    AgentRemoved {
        agent_id: AgentId,
        removed_at: DateTime<Utc>,
    },
}

impl AgentLifecycleEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            Self::AgentSpawned { agent_id, .. }
            | Self::AgentTransitioned { agent_id, .. }
            | Self::AgentHeartbeatMissed { agent_id, .. }
            | Self::AgentRestarted { agent_id, .. }
            | Self::AgentFailed { agent_id, .. }
            | Self::AgentRemoved { agent_id, .. } => *agent_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskSubmitted {
        task_id: TaskId,
        priority: i32,
        submitted_at: DateTime<Utc>,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        assigned_at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
        started_at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: Option<AgentId>,
        completed_at: DateTime<Utc>,
    },
    TaskRequeued {
        task_id: TaskId,
        retry_count: u32,
        error: String,
        requeued_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the task is terminal `Failed`
    TaskDeadLettered {
        task_id: TaskId,
        retry_count: u32,
        error: String,
        failed_at: DateTime<Utc>,
    },
    TaskCancelRequested {
        task_id: TaskId,
        agent_id: AgentId,
        requested_at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsensusEvent {
    ProposalCreated {
        proposal_id: ProposalId,
        proposer: AgentId,
        electorate_size: usize,
        required_votes: usize,
        created_at: DateTime<Utc>,
    },
    VoteCast {
        proposal_id: ProposalId,
        agent_id: AgentId,
        approve: bool,
        cast_at: DateTime<Utc>,
    },
    ProposalCommitted {
        proposal_id: ProposalId,
        yes_votes: usize,
        committed_at: DateTime<Utc>,
    },
    ProposalAborted {
        proposal_id: ProposalId,
        reason: String,
        aborted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LockEvent {
    LockAcquired {
        resource_id: String,
        agent_id: AgentId,
        acquired_at: DateTime<Utc>,
    },
    LockReleased {
        resource_id: String,
        agent_id: AgentId,
        released_at: DateTime<Utc>,
    },
    LockForceReleased {
        resource_id: String,
        agent_id: AgentId,
        reason: String,
        released_at: DateTime<Utc>,
    },
    DeadlockDetected {
        cycle: Vec<AgentId>,
        victim: AgentId,
        resource_id: String,
        detected_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    TopologyReconfigured {
        swarm_id: SwarmId,
        from: String,
        to: String,
        epoch: u64,
        aborted_proposals: usize,
        reconfigured_at: DateTime<Utc>,
    },
    SwarmHalted {
        swarm_id: SwarmId,
        reason: String,
        halted_at: DateTime<Utc>,
    },
    SwarmReset {
        swarm_id: SwarmId,
        reset_at: DateTime<Utc>,
    },
}
