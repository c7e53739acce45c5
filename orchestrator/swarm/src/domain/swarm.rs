// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Aggregate
//!
//! - [`Swarm`]: membership (join order), topology and quorum settings.
//! - [`SwarmStatus`]: point-in-time operational snapshot for callers.
//!
//! # Invariants
//!
//! - Members are unique and every member is a live agent in the registry.
//! - Changing the topology never changes the member list.

use crate::domain::topology;
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::swarm::{SwarmId, Topology};
use aegis_core::domain::swarm_config::SwarmConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: SwarmId,
    pub name: String,
    pub topology: Topology,
    pub consensus_threshold: f64,
    pub max_agents: usize,
    /// Members in join order
    pub members: Vec<AgentId>,
    /// Incremented on every topology change
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
}

impl Swarm {
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            id: SwarmId::new(),
            name: config.name.clone(),
            topology: config.topology.clone(),
            consensus_threshold: config.consensus_threshold,
            max_agents: config.max_agents,
            members: Vec::new(),
            epoch: 0,
            created_at: Utc::now(),
        }
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        self.members.contains(&agent)
    }

    /// Returns `false` if already a member.
    pub fn add_member(&mut self, agent: AgentId) -> bool {
        if self.contains(agent) {
            return false;
        }
        self.members.push(agent);
        true
    }

    /// Remove `agent`, dropping topology references to it.
    pub fn remove_member(&mut self, agent: AgentId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != agent);
        if self.members.len() == before {
            return false;
        }

        match &mut self.topology {
            Topology::Star { hub } if *hub == Some(agent) => *hub = None,
            Topology::Hierarchical { parents, .. } => {
                parents.retain(|child, parent| *child != agent && *parent != agent);
            }
            _ => {}
        }
        true
    }

    pub fn neighbors(&self, agent: AgentId) -> BTreeSet<AgentId> {
        topology::neighbors(&self.topology, &self.members, agent)
    }
}

/// Operational snapshot returned by `SwarmOrchestrator::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub swarm_id: SwarmId,
    pub name: String,
    pub topology: Topology,
    pub epoch: u64,
    pub members: Vec<AgentId>,
    pub live_agents: usize,
    pub max_agents: usize,
    pub agents_by_state: BTreeMap<String, usize>,
    pub tasks_by_state: BTreeMap<String, usize>,
    pub queue_capacity: usize,
    pub pending_proposals: usize,
    pub held_locks: usize,
    /// Reason the swarm is halted, if it is
    pub halted: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_is_unique_and_ordered() {
        let mut swarm = Swarm::from_config(&SwarmConfig::default());
        let (a, b) = (AgentId::new(), AgentId::new());
        assert!(swarm.add_member(a));
        assert!(swarm.add_member(b));
        assert!(!swarm.add_member(a));
        assert_eq!(swarm.members, vec![a, b]);
    }

    #[test]
    fn test_removing_hub_falls_back_to_first_member() {
        let mut swarm = Swarm::from_config(&SwarmConfig::default());
        let (a, b, c) = (AgentId::new(), AgentId::new(), AgentId::new());
        for m in [a, b, c] {
            swarm.add_member(m);
        }
        swarm.topology = Topology::Star { hub: Some(b) };
        assert!(swarm.remove_member(b));
        assert_eq!(swarm.topology, Topology::Star { hub: None });
        assert_eq!(swarm.neighbors(c), BTreeSet::from([a]));
        assert!(!swarm.remove_member(b));
    }
}
