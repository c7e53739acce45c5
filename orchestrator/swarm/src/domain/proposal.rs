// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Proposal Aggregate
//!
//! A state change that needs multi-agent agreement. The electorate is frozen
//! at creation; votes are counted with the early-decide rule:
//!
//! - commit as soon as `yes ≥ required`
//! - abort as soon as `yes + not_yet_voted < required`
//!
//! where `required = ⌈τ·N⌉`. The outcome is write-once.

use crate::domain::clock::VectorClock;
use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::swarm::{ProposalId, SwarmId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Not enough yes votes remain possible
    Rejected,
    /// Deadline passed undecided
    Timeout,
    /// Topology changed while pending
    Reconfigured,
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Reconfigured => "reconfigured",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Pending,
    Committed(serde_json::Value),
    Aborted(AbortReason),
}

impl ProposalOutcome {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Result of offering a vote to a pending proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteReceipt {
    pub outcome: ProposalOutcome,
    /// `false` when the agent had already voted (its first vote stands)
    pub counted: bool,
}

/// Yes votes needed out of `electorate` for threshold `threshold`.
pub fn required_votes(threshold: f64, electorate: usize) -> usize {
    if electorate == 0 {
        return 0;
    }
    // Tolerance keeps exact fractions like 2/3·3 from rounding up
    let raw = (threshold * electorate as f64 - 1e-9).ceil();
    (raw.max(1.0) as usize).min(electorate)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub swarm_id: SwarmId,
    pub proposer: AgentId,
    pub payload: serde_json::Value,
    /// Membership snapshot at creation
    pub electorate: BTreeSet<AgentId>,
    pub threshold: f64,
    pub required: usize,
    pub votes: BTreeMap<AgentId, bool>,
    /// Members the proposal was routed to
    pub delivered_to: BTreeSet<AgentId>,
    /// Router epoch at creation
    pub epoch: u64,
    pub clock: VectorClock,
    pub outcome: ProposalOutcome,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Proposal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ProposalId,
        swarm_id: SwarmId,
        proposer: AgentId,
        payload: serde_json::Value,
        electorate: BTreeSet<AgentId>,
        threshold: f64,
        deadline: DateTime<Utc>,
        epoch: u64,
    ) -> Self {
        let required = required_votes(threshold, electorate.len());
        Self {
            id,
            swarm_id,
            proposer,
            payload,
            electorate,
            threshold,
            required,
            votes: BTreeMap::new(),
            delivered_to: BTreeSet::new(),
            epoch,
            clock: VectorClock::new(),
            outcome: ProposalOutcome::Pending,
            created_at: Utc::now(),
            deadline,
            decided_at: None,
        }
    }

    pub fn yes_votes(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    pub fn remaining_votes(&self) -> usize {
        self.electorate.len().saturating_sub(self.votes.len())
    }

    pub fn record_vote(&mut self, agent: AgentId, approve: bool) -> SwarmResult<VoteReceipt> {
        if self.outcome.is_decided() {
            return Err(SwarmError::LateVote(self.id));
        }
        if !self.electorate.contains(&agent) {
            return Err(SwarmError::NotEligible {
                proposal: self.id,
                agent,
            });
        }
        if self.votes.contains_key(&agent) {
            return Ok(VoteReceipt {
                outcome: self.outcome.clone(),
                counted: false,
            });
        }

        self.votes.insert(agent, approve);

        let yes = self.yes_votes();
        if yes >= self.required {
            self.decide(ProposalOutcome::Committed(self.payload.clone()));
        } else if yes + self.remaining_votes() < self.required {
            self.decide(ProposalOutcome::Aborted(AbortReason::Rejected));
        }

        Ok(VoteReceipt {
            outcome: self.outcome.clone(),
            counted: true,
        })
    }

    /// Set the outcome if still pending. Returns whether it changed.
    pub fn decide(&mut self, outcome: ProposalOutcome) -> bool {
        if self.outcome.is_decided() || !outcome.is_decided() {
            return false;
        }
        self.outcome = outcome;
        self.decided_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn proposal(n: usize, threshold: f64) -> (Proposal, Vec<AgentId>) {
        let voters: Vec<AgentId> = (0..n).map(|_| AgentId::new()).collect();
        let p = Proposal::new(
            ProposalId::new(),
            SwarmId::new(),
            voters[0],
            json!({"op": "scale"}),
            voters.iter().copied().collect(),
            threshold,
            Utc::now(),
            0,
        );
        (p, voters)
    }

    #[test]
    fn test_required_votes() {
        assert_eq!(required_votes(0.7, 3), 3);
        assert_eq!(required_votes(2.0 / 3.0, 3), 2);
        assert_eq!(required_votes(0.5, 4), 2);
        assert_eq!(required_votes(1.0, 5), 5);
        assert_eq!(required_votes(0.01, 5), 1);
    }

    #[test]
    fn test_yes_yes_no_aborts_below_threshold() {
        let (mut p, v) = proposal(3, 0.7);
        assert_eq!(p.record_vote(v[0], true).unwrap().outcome, ProposalOutcome::Pending);
        assert_eq!(p.record_vote(v[1], true).unwrap().outcome, ProposalOutcome::Pending);
        assert_eq!(
            p.record_vote(v[2], false).unwrap().outcome,
            ProposalOutcome::Aborted(AbortReason::Rejected)
        );
    }

    #[test]
    fn test_commits_only_on_third_yes() {
        let (mut p, v) = proposal(3, 0.7);
        p.record_vote(v[0], true).unwrap();
        assert_eq!(p.record_vote(v[1], true).unwrap().outcome, ProposalOutcome::Pending);
        assert!(p.record_vote(v[2], true).unwrap().outcome.is_committed());
    }

    #[test]
    fn test_early_abort_before_all_votes() {
        let (mut p, v) = proposal(5, 0.6);
        // required = 3; after three no votes only two yes remain possible
        p.record_vote(v[0], false).unwrap();
        p.record_vote(v[1], false).unwrap();
        let receipt = p.record_vote(v[2], false).unwrap();
        assert_eq!(receipt.outcome, ProposalOutcome::Aborted(AbortReason::Rejected));
    }

    #[test]
    fn test_first_vote_stands() {
        let (mut p, v) = proposal(3, 0.5);
        p.record_vote(v[0], false).unwrap();
        let receipt = p.record_vote(v[0], true).unwrap();
        assert!(!receipt.counted);
        assert!(!p.votes[&v[0]]);
    }

    #[test]
    fn test_late_and_ineligible_votes() {
        let (mut p, v) = proposal(1, 1.0);
        p.record_vote(v[0], true).unwrap();
        assert!(matches!(p.record_vote(v[0], true), Err(SwarmError::LateVote(_))));

        let (mut p, _) = proposal(2, 1.0);
        assert!(matches!(
            p.record_vote(AgentId::new(), true),
            Err(SwarmError::NotEligible { .. })
        ));
    }

    #[test]
    fn test_outcome_is_write_once() {
        let (mut p, _) = proposal(2, 1.0);
        assert!(p.decide(ProposalOutcome::Aborted(AbortReason::Timeout)));
        assert!(!p.decide(ProposalOutcome::Committed(json!(1))));
        assert_eq!(p.outcome, ProposalOutcome::Aborted(AbortReason::Timeout));
    }
}
