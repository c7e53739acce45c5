// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Swarm identity and topology modes.

use crate::domain::agent::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_fanout() -> usize {
    2
}

/// Neighbor-connectivity rule for a swarm.
///
/// ```yaml
/// topology:
///   mode: hierarchical
///   fanout: 3
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Topology {
    /// Every member talks to every other member
    #[default]
    Mesh,

    /// One hub; spokes only see the hub. `None` means the first member joined.
    Star {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hub: Option<AgentId>,
    },

    /// Rooted tree. Explicit `parents` take precedence; members without an
    /// entry are placed by join order with `fanout` children per node.
    Hierarchical {
        #[serde(default = "default_fanout")]
        fanout: usize,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parents: BTreeMap<AgentId, AgentId>,
    },

    /// Predecessor and successor in join order
    Ring,
}

impl Topology {
    pub fn hierarchical(fanout: usize) -> Self {
        Self::Hierarchical {
            fanout,
            parents: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mesh => "mesh",
            Self::Star { .. } => "star",
            Self::Hierarchical { .. } => "hierarchical",
            Self::Ring => "ring",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_yaml_tagging() {
        let topology: Topology = serde_yaml::from_str("mode: hierarchical\n").unwrap();
        assert_eq!(topology, Topology::hierarchical(2));

        let topology: Topology = serde_yaml::from_str("mode: star\n").unwrap();
        assert_eq!(topology, Topology::Star { hub: None });

        let yaml = serde_yaml::to_string(&Topology::Ring).unwrap();
        assert!(yaml.contains("mode: ring"));
    }
}
