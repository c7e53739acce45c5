// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Causal Delivery
//!
//! Swarm updates (proposals and votes) are stamped with the origin agent's
//! vector clock and applied in causal order. An update that arrives before
//! something it depends on waits in a buffer until the gap is filled.

use crate::domain::clock::VectorClock;
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::swarm::ProposalId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalUpdate<T> {
    pub origin: AgentId,
    pub clock: VectorClock,
    pub payload: T,
}

/// Replicated consensus operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SwarmUpdate {
    Propose {
        proposal_id: ProposalId,
        payload: serde_json::Value,
    },
    Vote {
        proposal_id: ProposalId,
        approve: bool,
    },
}

pub struct CausalDelivery<T> {
    /// Last clock issued to each origin
    clocks: HashMap<AgentId, VectorClock>,
    applied: VectorClock,
    buffer: Vec<CausalUpdate<T>>,
}

impl<T> Default for CausalDelivery<T> {
    fn default() -> Self {
        Self {
            clocks: HashMap::new(),
            applied: VectorClock::new(),
            buffer: Vec::new(),
        }
    }
}

impl<T> CausalDelivery<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a local update from `origin`: everything already applied
    /// happened before it.
    pub fn stamp(&mut self, origin: AgentId, payload: T) -> CausalUpdate<T> {
        let clock = self.clocks.entry(origin).or_default();
        clock.merge(&self.applied);
        clock.increment(origin);
        CausalUpdate {
            origin,
            clock: clock.clone(),
            payload,
        }
    }

    /// Accept an update; returns every update that became deliverable, in order.
    pub fn receive(&mut self, update: CausalUpdate<T>) -> Vec<CausalUpdate<T>> {
        if update.clock.get(update.origin) <= self.applied.get(update.origin) {
            debug!(origin = %update.origin, "Dropping duplicate causal update");
            return Vec::new();
        }

        let mut delivered = Vec::new();
        if update.clock.is_next_from(update.origin, &self.applied) {
            self.apply(&update);
            delivered.push(update);
        } else {
            debug!(
                origin = %update.origin,
                buffered = self.buffer.len() + 1,
                "Buffering causal update until its dependencies arrive"
            );
            self.buffer.push(update);
            return delivered;
        }

        // Each delivery may unblock others
        while let Some(index) = self
            .buffer
            .iter()
            .position(|u| u.clock.is_next_from(u.origin, &self.applied))
        {
            let next = self.buffer.remove(index);
            self.apply(&next);
            delivered.push(next);
        }
        self.buffer
            .retain(|u| u.clock.get(u.origin) > self.applied.get(u.origin));
        delivered
    }

    fn apply(&mut self, update: &CausalUpdate<T>) {
        self.applied.merge(&update.clock);
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn applied_clock(&self) -> &VectorClock {
        &self.applied
    }

    /// Stop issuing clocks for `agent`. Its applied component is kept so
    /// stale updates still read as duplicates.
    pub fn forget(&mut self, agent: AgentId) {
        self.clocks.remove(&agent);
        self.buffer.retain(|u| u.origin != agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_updates_deliver_immediately() {
        let mut local = CausalDelivery::new();
        let a = AgentId::new();
        let first = local.stamp(a, "one");
        let second = local.stamp(a, "two");

        let mut remote = CausalDelivery::new();
        assert_eq!(remote.receive(first).len(), 1);
        assert_eq!(remote.receive(second).len(), 1);
        assert_eq!(remote.applied_clock().get(a), 2);
    }

    #[test]
    fn test_out_of_order_update_is_buffered() {
        let (a, b) = (AgentId::new(), AgentId::new());
        let mut origin = CausalDelivery::new();
        let proposal = origin.stamp(a, "propose");
        origin.receive(proposal.clone());
        let vote = origin.stamp(b, "vote");
        assert_eq!(vote.clock.get(a), 1);

        let mut replica = CausalDelivery::new();
        assert!(replica.receive(vote).is_empty());
        assert_eq!(replica.pending(), 1);

        let delivered: Vec<&str> = replica.receive(proposal).into_iter().map(|u| u.payload).collect();
        assert_eq!(delivered, vec!["propose", "vote"]);
        assert_eq!(replica.pending(), 0);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let a = AgentId::new();
        let mut delivery = CausalDelivery::new();
        let update = delivery.stamp(a, 1);
        assert_eq!(delivery.receive(update.clone()).len(), 1);
        assert!(delivery.receive(update).is_empty());
        assert_eq!(delivery.pending(), 0);
    }

    #[test]
    fn test_forget_drops_buffered_updates() {
        let (a, b) = (AgentId::new(), AgentId::new());
        let mut delivery = CausalDelivery::new();
        let blocked = CausalUpdate {
            origin: b,
            clock: VectorClock::from_entries([(a, 1), (b, 1)]),
            payload: (),
        };
        delivery.receive(blocked);
        delivery.forget(b);
        assert_eq!(delivery.pending(), 0);
    }
}
