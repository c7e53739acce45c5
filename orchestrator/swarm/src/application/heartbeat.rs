// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Heartbeat deadline tracking.
//!
//! Deadlines live in a min-heap. A beat pushes a new entry instead of
//! updating the old one; stale entries are recognised by their generation and
//! skipped when they surface, so both `beat` and `expired` are O(log n).

use aegis_core::domain::agent::AgentId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

pub struct HeartbeatMonitor {
    timeout: Duration,
    heap: BinaryHeap<Reverse<(Instant, AgentId, u64)>>,
    /// Current (generation, deadline) per tracked agent
    current: HashMap<AgentId, (u64, Instant)>,
    generation: u64,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            heap: BinaryHeap::new(),
            current: HashMap::new(),
            generation: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start tracking `agent` as of `now`.
    pub fn track(&mut self, agent: AgentId, now: Instant) {
        self.beat(agent, now);
    }

    pub fn beat(&mut self, agent: AgentId, now: Instant) {
        self.generation += 1;
        let deadline = now + self.timeout;
        self.current.insert(agent, (self.generation, deadline));
        self.heap.push(Reverse((deadline, agent, self.generation)));

        // Keep the heap from growing without bound under frequent beats
        if self.heap.len() > 4 * self.current.len().max(16) {
            self.compact();
        }
    }

    pub fn untrack(&mut self, agent: AgentId) -> bool {
        self.current.remove(&agent).is_some()
    }

    /// Agents whose deadline is at or before `now`; they stop being tracked.
    pub fn expired(&mut self, now: Instant) -> Vec<AgentId> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, agent, generation))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.current.get(&agent).map(|(g, _)| *g) == Some(generation) {
                self.current.remove(&agent);
                expired.push(agent);
            }
        }
        expired
    }

    pub fn deadline(&self, agent: AgentId) -> Option<Instant> {
        self.current.get(&agent).map(|(_, deadline)| *deadline)
    }

    pub fn tracked_count(&self) -> usize {
        self.current.len()
    }

    fn compact(&mut self) {
        self.heap = self
            .current
            .iter()
            .map(|(agent, (generation, deadline))| Reverse((*deadline, *agent, *generation)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_and_beats() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10));
        let (a, b) = (AgentId::new(), AgentId::new());
        monitor.track(a, start);
        monitor.track(b, start);

        monitor.beat(a, start + Duration::from_secs(8));
        assert!(monitor.expired(start + Duration::from_secs(9)).is_empty());
        assert_eq!(monitor.expired(start + Duration::from_secs(10)), vec![b]);
        assert!(monitor.expired(start + Duration::from_secs(17)).is_empty());
        assert_eq!(monitor.expired(start + Duration::from_secs(18)), vec![a]);
        assert_eq!(monitor.tracked_count(), 0);
    }

    #[test]
    fn test_untracked_agents_never_expire() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1));
        let a = AgentId::new();
        monitor.track(a, start);
        assert!(monitor.untrack(a));
        assert!(monitor.expired(start + Duration::from_secs(5)).is_empty());
        assert!(monitor.deadline(a).is_none());
    }

    #[test]
    fn test_compaction_keeps_current_deadlines() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10));
        let a = AgentId::new();
        for i in 0..200 {
            monitor.beat(a, start + Duration::from_millis(i));
        }
        assert!(monitor.heap.len() <= 64);
        assert_eq!(monitor.deadline(a), Some(start + Duration::from_millis(199) + Duration::from_secs(10)));
        assert!(monitor.expired(start + Duration::from_secs(10)).is_empty());
    }
}
