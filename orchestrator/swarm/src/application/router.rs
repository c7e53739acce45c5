// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Topology Router
//!
//! Owns the swarm's membership and topology behind one `RwLock`, so a
//! reconfiguration can never interleave with a join or a leave.

use crate::domain::swarm::Swarm;
use crate::domain::topology;
use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::swarm::Topology;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "to", rename_all = "snake_case")]
pub enum Destination {
    /// Every neighbor of the sender
    Broadcast,
    Direct(AgentId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconfigureReport {
    pub from: Topology,
    pub to: Topology,
    pub epoch: u64,
    pub members: Vec<AgentId>,
}

pub struct TopologyRouter {
    swarm: RwLock<Swarm>,
}

impl TopologyRouter {
    pub fn new(swarm: Swarm) -> SwarmResult<Self> {
        // Explicit hubs and parents can only be checked once members join
        if let Topology::Hierarchical { fanout: 0, .. } = swarm.topology {
            return Err(SwarmError::InvalidTopology(
                "hierarchical fanout must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            swarm: RwLock::new(swarm),
        })
    }

    pub fn neighbors(&self, agent: AgentId) -> BTreeSet<AgentId> {
        self.swarm.read().neighbors(agent)
    }

    /// Recipients of a message sent by `from`; empty when nothing is reachable.
    pub fn route(&self, destination: &Destination, from: AgentId) -> BTreeSet<AgentId> {
        let swarm = self.swarm.read();
        let recipients = match destination {
            Destination::Broadcast => swarm.neighbors(from),
            Destination::Direct(to) => topology::next_hop(&swarm.topology, &swarm.members, from, *to)
                .into_iter()
                .collect(),
        };
        debug!(
            from = %from,
            destination = ?destination,
            recipients = recipients.len(),
            "Routed message"
        );
        recipients
    }

    /// Members reachable from `from` by repeated forwarding, excluding `from`.
    pub fn reachable(&self, from: AgentId) -> BTreeSet<AgentId> {
        let swarm = self.swarm.read();
        topology::reachable(&swarm.topology, &swarm.members, from)
    }

    pub fn reconfigure(&self, target: Topology) -> SwarmResult<ReconfigureReport> {
        let mut swarm = self.swarm.write();
        topology::validate(&target, &swarm.members).map_err(SwarmError::InvalidTopology)?;

        let from = std::mem::replace(&mut swarm.topology, target.clone());
        swarm.epoch += 1;
        info!(
            from = %from,
            to = %target,
            epoch = swarm.epoch,
            members = swarm.members.len(),
            "Topology reconfigured"
        );
        metrics::counter!("aegis_swarm_reconfigurations_total", "to" => target.kind()).increment(1);

        Ok(ReconfigureReport {
            from,
            to: target,
            epoch: swarm.epoch,
            members: swarm.members.clone(),
        })
    }

    pub fn add_member(&self, agent: AgentId) -> bool {
        let added = self.swarm.write().add_member(agent);
        if added {
            debug!(agent_id = %agent, "Member joined swarm");
        }
        added
    }

    pub fn remove_member(&self, agent: AgentId) -> bool {
        let removed = self.swarm.write().remove_member(agent);
        if removed {
            debug!(agent_id = %agent, "Member left swarm");
        }
        removed
    }

    pub fn members(&self) -> Vec<AgentId> {
        self.swarm.read().members.clone()
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        self.swarm.read().contains(agent)
    }

    pub fn epoch(&self) -> u64 {
        self.swarm.read().epoch
    }

    pub fn topology(&self) -> Topology {
        self.swarm.read().topology.clone()
    }

    pub fn adjacency(&self) -> BTreeMap<AgentId, BTreeSet<AgentId>> {
        let swarm = self.swarm.read();
        topology::adjacency(&swarm.topology, &swarm.members)
    }

    pub fn snapshot(&self) -> Swarm {
        self.swarm.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::domain::swarm_config::SwarmConfig;

    fn router(topology: Topology, n: usize) -> (TopologyRouter, Vec<AgentId>) {
        let config = SwarmConfig {
            topology,
            ..Default::default()
        };
        let router = TopologyRouter::new(Swarm::from_config(&config)).unwrap();
        let members: Vec<AgentId> = (0..n).map(|_| AgentId::new()).collect();
        for m in &members {
            router.add_member(*m);
        }
        (router, members)
    }

    #[test]
    fn test_rejects_zero_fanout() {
        let config = SwarmConfig {
            topology: Topology::hierarchical(0),
            ..Default::default()
        };
        assert!(matches!(
            TopologyRouter::new(Swarm::from_config(&config)),
            Err(SwarmError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_broadcast_goes_to_neighbors() {
        let (router, m) = router(Topology::Star { hub: None }, 4);
        assert_eq!(router.route(&Destination::Broadcast, m[2]), BTreeSet::from([m[0]]));
        assert_eq!(router.route(&Destination::Broadcast, m[0]).len(), 3);
    }

    #[test]
    fn test_direct_uses_next_hop() {
        let (router, m) = router(Topology::Ring, 5);
        // m0 → m2 goes through m1
        assert_eq!(router.route(&Destination::Direct(m[2]), m[0]), BTreeSet::from([m[1]]));
        assert_eq!(router.route(&Destination::Direct(m[1]), m[0]), BTreeSet::from([m[1]]));
        assert!(router.route(&Destination::Direct(AgentId::new()), m[0]).is_empty());
    }

    #[test]
    fn test_mesh_to_hierarchical_keeps_members() {
        let (router, members) = router(Topology::Mesh, 5);
        let report = router.reconfigure(Topology::hierarchical(2)).unwrap();

        assert_eq!(report.epoch, 1);
        assert_eq!(report.members, members);
        assert_eq!(router.members(), members);
        for m in &members {
            assert!(!router.neighbors(*m).is_empty());
        }
    }

    #[test]
    fn test_invalid_reconfigure_leaves_state_untouched() {
        let (router, _) = router(Topology::Mesh, 3);
        let err = router
            .reconfigure(Topology::Star {
                hub: Some(AgentId::new()),
            })
            .unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTopology(_)));
        assert_eq!(router.epoch(), 0);
        assert_eq!(router.topology(), Topology::Mesh);
    }

    #[test]
    fn test_remove_member_updates_adjacency() {
        let (router, m) = router(Topology::Ring, 3);
        assert!(router.remove_member(m[1]));
        assert!(!router.remove_member(m[1]));
        let adjacency = router.adjacency();
        assert_eq!(adjacency[&m[0]], BTreeSet::from([m[2]]));
        assert_eq!(router.reachable(m[0]), BTreeSet::from([m[2]]));
    }
}
