// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Vector clocks for causal ordering of swarm updates.

use aegis_core::domain::agent::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One logical counter per known agent; absent entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<AgentId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (AgentId, u64)>) -> Self {
        Self {
            entries: entries.into_iter().filter(|(_, v)| *v > 0).collect(),
        }
    }

    pub fn get(&self, agent: AgentId) -> u64 {
        self.entries.get(&agent).copied().unwrap_or(0)
    }

    /// Tick `agent`'s component, returning the new value.
    pub fn increment(&mut self, agent: AgentId) -> u64 {
        let counter = self.entries.entry(agent).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Component-wise max.
    pub fn merge(&mut self, other: &VectorClock) {
        for (agent, value) in &other.entries {
            let counter = self.entries.entry(*agent).or_insert(0);
            *counter = (*counter).max(*value);
        }
    }

    /// `self ≤ other` component-wise and `self ≠ other`.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.entries.iter().all(|(agent, v)| *v <= other.get(*agent)) && self != other
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self != other && !self.happened_before(other) && !other.happened_before(self)
    }

    /// Whether an update stamped `self` by `origin` is deliverable on top of `applied`:
    /// it is the next update from `origin`, and everything else it has seen is applied.
    pub fn is_next_from(&self, origin: AgentId, applied: &VectorClock) -> bool {
        self.get(origin) == applied.get(origin) + 1
            && self
                .entries
                .iter()
                .filter(|(agent, _)| **agent != origin)
                .all(|(agent, v)| *v <= applied.get(*agent))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &u64)> {
        self.entries.iter()
    }
}
