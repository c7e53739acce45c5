// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Neighbor rules for each [`Topology`] mode.
//!
//! `members` is always the swarm's join order. Every function here is pure so
//! the router can evaluate them under its read lock.

use aegis_core::domain::agent::AgentId;
use aegis_core::domain::swarm::Topology;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Neighbors of `agent`; empty when `agent` is not a member.
pub fn neighbors(topology: &Topology, members: &[AgentId], agent: AgentId) -> BTreeSet<AgentId> {
    let Some(index) = members.iter().position(|m| *m == agent) else {
        return BTreeSet::new();
    };

    match topology {
        Topology::Mesh => members.iter().copied().filter(|m| *m != agent).collect(),
        Topology::Star { hub } => {
            let Some(hub) = effective_hub(*hub, members) else {
                return BTreeSet::new();
            };
            if hub == agent {
                members.iter().copied().filter(|m| *m != agent).collect()
            } else {
                BTreeSet::from([hub])
            }
        }
        Topology::Hierarchical { fanout, parents } => {
            let tree = parent_map(*fanout, parents, members);
            let mut result: BTreeSet<AgentId> = tree
                .iter()
                .filter(|(_, parent)| **parent == agent)
                .map(|(child, _)| *child)
                .collect();
            if let Some(parent) = tree.get(&agent) {
                result.insert(*parent);
            }
            result
        }
        Topology::Ring => {
            let n = members.len();
            if n < 2 {
                return BTreeSet::new();
            }
            let predecessor = members[(index + n - 1) % n];
            let successor = members[(index + 1) % n];
            BTreeSet::from([predecessor, successor])
        }
    }
}

/// Neighbor sets for every member.
pub fn adjacency(topology: &Topology, members: &[AgentId]) -> BTreeMap<AgentId, BTreeSet<AgentId>> {
    members
        .iter()
        .map(|m| (*m, neighbors(topology, members, *m)))
        .collect()
}

/// First hop on a shortest path from `from` to `to`, or `None` if unreachable.
pub fn next_hop(topology: &Topology, members: &[AgentId], from: AgentId, to: AgentId) -> Option<AgentId> {
    if from == to {
        return None;
    }
    let graph = adjacency(topology, members);
    if !graph.contains_key(&from) || !graph.contains_key(&to) {
        return None;
    }

    // BFS carrying the first hop taken out of `from`
    let mut first_hop: HashMap<AgentId, AgentId> = HashMap::new();
    let mut frontier = VecDeque::new();
    for neighbor in &graph[&from] {
        first_hop.insert(*neighbor, *neighbor);
        frontier.push_back(*neighbor);
    }
    while let Some(node) = frontier.pop_front() {
        if node == to {
            return first_hop.get(&node).copied();
        }
        let hop = first_hop[&node];
        for next in &graph[&node] {
            if *next != from && !first_hop.contains_key(next) {
                first_hop.insert(*next, hop);
                frontier.push_back(*next);
            }
        }
    }
    None
}

/// Every member reachable from `from` over the topology graph, excluding `from`.
pub fn reachable(topology: &Topology, members: &[AgentId], from: AgentId) -> BTreeSet<AgentId> {
    let graph = adjacency(topology, members);
    let mut seen = BTreeSet::new();
    if !graph.contains_key(&from) {
        return seen;
    }
    let mut frontier = VecDeque::from([from]);
    while let Some(node) = frontier.pop_front() {
        for next in &graph[&node] {
            if *next != from && seen.insert(*next) {
                frontier.push_back(*next);
            }
        }
    }
    seen
}

/// Check `topology` against the current membership.
pub fn validate(topology: &Topology, members: &[AgentId]) -> Result<(), String> {
    match topology {
        Topology::Mesh | Topology::Ring => Ok(()),
        Topology::Star { hub: None } => Ok(()),
        Topology::Star { hub: Some(hub) } => {
            if members.contains(hub) {
                Ok(())
            } else {
                Err(format!("star hub {} is not a swarm member", hub))
            }
        }
        Topology::Hierarchical { fanout, parents } => {
            if *fanout == 0 {
                return Err("hierarchical fanout must be at least 1".to_string());
            }
            for (child, parent) in parents {
                if child == parent {
                    return Err(format!("agent {} cannot be its own parent", child));
                }
                if !members.contains(child) {
                    return Err(format!("parent assignment for non-member {}", child));
                }
                if !members.contains(parent) {
                    return Err(format!("parent {} of {} is not a swarm member", parent, child));
                }
            }
            if let Some(agent) = first_cycle(parents) {
                return Err(format!("parent assignments form a cycle through {}", agent));
            }
            Ok(())
        }
    }
}

fn effective_hub(hub: Option<AgentId>, members: &[AgentId]) -> Option<AgentId> {
    hub.filter(|h| members.contains(h))
        .or_else(|| members.first().copied())
}

/// child → parent for every non-root member.
///
/// Explicit assignments whose endpoints are both members win. The remaining
/// members form a complete `fanout`-ary tree in join order, rooted at the
/// first of them, and explicitly placed members hang off that tree.
fn parent_map(
    fanout: usize,
    explicit: &BTreeMap<AgentId, AgentId>,
    members: &[AgentId],
) -> BTreeMap<AgentId, AgentId> {
    let fanout = fanout.max(1);
    let mut tree: BTreeMap<AgentId, AgentId> = explicit
        .iter()
        .filter(|(child, parent)| child != parent && members.contains(child) && members.contains(parent))
        .map(|(child, parent)| (*child, *parent))
        .collect();

    let implicit: Vec<AgentId> = members
        .iter()
        .copied()
        .filter(|m| !tree.contains_key(m))
        .collect();
    for (i, member) in implicit.iter().enumerate().skip(1) {
        tree.insert(*member, implicit[(i - 1) / fanout]);
    }
    tree
}

fn first_cycle(parents: &BTreeMap<AgentId, AgentId>) -> Option<AgentId> {
    for start in parents.keys() {
        let mut seen = BTreeSet::new();
        let mut node = *start;
        while let Some(parent) = parents.get(&node) {
            if !seen.insert(node) {
                return Some(node);
            }
            node = *parent;
        }
    }
    None
}
