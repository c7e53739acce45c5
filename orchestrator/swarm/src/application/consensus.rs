// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Consensus Coordinator
//!
//! Tracks open proposals and their votes. Each proposal lives in its own slot
//! with a `parking_lot` mutex for the record and a `watch` channel that wakes
//! [`ConsensusCoordinator::await_outcome`] callers once the outcome is fixed.
//!
//! Deadlines are enforced lazily on every access and eagerly by
//! [`ConsensusCoordinator::expire`], which the maintenance loop calls.
//! Decided proposals stay queryable for the retention window, then
//! [`ConsensusCoordinator::gc`] drops them.

use crate::domain::clock::VectorClock;
use crate::domain::proposal::{AbortReason, Proposal, ProposalOutcome};
use crate::domain::swarm::Swarm;
use crate::error::{SwarmError, SwarmResult};
use aegis_core::domain::agent::AgentId;
use aegis_core::domain::events::ConsensusEvent;
use aegis_core::domain::swarm::ProposalId;
use aegis_core::infrastructure::event_bus::EventBus;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything needed to open a proposal besides the swarm snapshot.
#[derive(Debug, Clone)]
pub struct ProposalDraft {
    pub id: ProposalId,
    pub proposer: AgentId,
    pub payload: serde_json::Value,
    pub delivered_to: BTreeSet<AgentId>,
    pub clock: VectorClock,
}

struct SlotRecord {
    proposal: Proposal,
    deadline: Instant,
    decided: Option<Instant>,
}

struct ProposalSlot {
    record: Mutex<SlotRecord>,
    outcome_tx: watch::Sender<ProposalOutcome>,
}

pub struct ConsensusCoordinator {
    proposals: DashMap<ProposalId, Arc<ProposalSlot>>,
    timeout: Duration,
    event_bus: EventBus,
}

impl ConsensusCoordinator {
    pub fn new(timeout: Duration, event_bus: EventBus) -> Self {
        Self {
            proposals: DashMap::new(),
            timeout,
            event_bus,
        }
    }

    fn slot(&self, id: ProposalId) -> SwarmResult<Arc<ProposalSlot>> {
        self.proposals
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SwarmError::proposal_not_found(id))
    }

    /// Open a proposal with the swarm's current membership as electorate.
    pub fn propose(&self, swarm: &Swarm, draft: ProposalDraft) -> SwarmResult<Proposal> {
        if !swarm.contains(draft.proposer) {
            return Err(SwarmError::NotEligible {
                proposal: draft.id,
                agent: draft.proposer,
            });
        }
        if self.proposals.contains_key(&draft.id) {
            return Err(SwarmError::InvariantViolation(format!(
                "proposal {} opened twice",
                draft.id
            )));
        }

        let deadline = Instant::now() + self.timeout;
        let wall_deadline = Utc::now()
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut proposal = Proposal::new(
            draft.id,
            swarm.id,
            draft.proposer,
            draft.payload,
            swarm.members.iter().copied().collect(),
            swarm.consensus_threshold,
            wall_deadline,
            swarm.epoch,
        );
        proposal.delivered_to = draft.delivered_to;
        proposal.clock = draft.clock;

        let (outcome_tx, _) = watch::channel(ProposalOutcome::Pending);
        let slot = Arc::new(ProposalSlot {
            record: Mutex::new(SlotRecord {
                proposal: proposal.clone(),
                deadline,
                decided: None,
            }),
            outcome_tx,
        });
        self.proposals.insert(proposal.id, slot);

        info!(
            proposal_id = %proposal.id,
            proposer = %proposal.proposer,
            electorate = proposal.electorate.len(),
            required = proposal.required,
            "Proposal created"
        );
        metrics::counter!("aegis_swarm_proposals_total").increment(1);
        self.event_bus.publish_consensus_event(ConsensusEvent::ProposalCreated {
            proposal_id: proposal.id,
            proposer: proposal.proposer,
            electorate_size: proposal.electorate.len(),
            required_votes: proposal.required,
            created_at: proposal.created_at,
        });
        Ok(proposal)
    }

    /// Record a vote; the agent's first vote stands.
    pub fn vote(&self, id: ProposalId, agent: AgentId, approve: bool) -> SwarmResult<ProposalOutcome> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock();

        if !record.proposal.outcome.is_decided() && Instant::now() >= record.deadline {
            self.settle(&slot, &mut record, ProposalOutcome::Aborted(AbortReason::Timeout));
            return Err(SwarmError::ConsensusTimeout(id));
        }

        let receipt = record.proposal.record_vote(agent, approve)?;
        if receipt.counted {
            debug!(proposal_id = %id, agent_id = %agent, approve, "Vote recorded");
            self.event_bus.publish_consensus_event(ConsensusEvent::VoteCast {
                proposal_id: id,
                agent_id: agent,
                approve,
                cast_at: Utc::now(),
            });
            if receipt.outcome.is_decided() {
                self.announce(&slot, &mut record);
            }
        } else {
            debug!(proposal_id = %id, agent_id = %agent, "Ignoring repeated vote");
        }
        Ok(receipt.outcome)
    }

    /// Decide a pending proposal and notify waiters. Returns whether it changed.
    fn settle(&self, slot: &ProposalSlot, record: &mut SlotRecord, outcome: ProposalOutcome) -> bool {
        if !record.proposal.decide(outcome) {
            return false;
        }
        self.announce(slot, record);
        true
    }

    /// Publish an outcome that was just fixed on `record.proposal`.
    fn announce(&self, slot: &ProposalSlot, record: &mut SlotRecord) {
        record.decided = Some(Instant::now());
        let proposal = &record.proposal;
        let decided_at = proposal.decided_at.unwrap_or_else(Utc::now);
        slot.outcome_tx.send_replace(proposal.outcome.clone());

        match &proposal.outcome {
            ProposalOutcome::Committed(_) => {
                info!(proposal_id = %proposal.id, yes = proposal.yes_votes(), "Proposal committed");
                metrics::counter!("aegis_swarm_proposal_outcomes_total", "outcome" => "committed").increment(1);
                self.event_bus.publish_consensus_event(ConsensusEvent::ProposalCommitted {
                    proposal_id: proposal.id,
                    yes_votes: proposal.yes_votes(),
                    committed_at: decided_at,
                });
            }
            ProposalOutcome::Aborted(reason) => {
                if *reason == AbortReason::Timeout {
                    warn!(proposal_id = %proposal.id, votes = proposal.votes.len(), "Proposal timed out");
                } else {
                    info!(proposal_id = %proposal.id, reason = %reason, "Proposal aborted");
                }
                metrics::counter!("aegis_swarm_proposal_outcomes_total", "outcome" => reason.to_string())
                    .increment(1);
                self.event_bus.publish_consensus_event(ConsensusEvent::ProposalAborted {
                    proposal_id: proposal.id,
                    reason: reason.to_string(),
                    aborted_at: decided_at,
                });
            }
            ProposalOutcome::Pending => {}
        }
    }

    fn expire_slot(&self, slot: &ProposalSlot, now: Instant) -> bool {
        let mut record = slot.record.lock();
        if record.proposal.outcome.is_decided() || now < record.deadline {
            return false;
        }
        self.settle(slot, &mut record, ProposalOutcome::Aborted(AbortReason::Timeout))
    }

    pub fn outcome(&self, id: ProposalId) -> SwarmResult<ProposalOutcome> {
        let slot = self.slot(id)?;
        self.expire_slot(&slot, Instant::now());
        let outcome = slot.record.lock().proposal.outcome.clone();
        Ok(outcome)
    }

    pub fn proposal(&self, id: ProposalId) -> SwarmResult<Proposal> {
        let slot = self.slot(id)?;
        self.expire_slot(&slot, Instant::now());
        let proposal = slot.record.lock().proposal.clone();
        Ok(proposal)
    }

    /// Wait until the proposal is decided.
    ///
    /// A proposal that reaches its deadline undecided is aborted and reported
    /// as `ConsensusTimeout`.
    pub async fn await_outcome(&self, id: ProposalId) -> SwarmResult<ProposalOutcome> {
        let slot = self.slot(id)?;
        let mut rx = slot.outcome_tx.subscribe();
        let deadline = slot.record.lock().deadline;

        let waited = tokio::time::timeout_at(deadline, rx.wait_for(|o| o.is_decided()))
            .await
            .ok()
            .and_then(|r| r.ok().map(|outcome| outcome.clone()));

        let outcome = match waited {
            Some(outcome) => outcome,
            None => {
                self.expire_slot(&slot, Instant::now());
                let outcome = slot.record.lock().proposal.outcome.clone();
                outcome
            }
        };
        match outcome {
            ProposalOutcome::Aborted(AbortReason::Timeout) | ProposalOutcome::Pending => {
                Err(SwarmError::ConsensusTimeout(id))
            }
            outcome => Ok(outcome),
        }
    }

    /// Abort a pending proposal. Returns `false` if it was already decided.
    pub fn cancel(&self, id: ProposalId) -> SwarmResult<bool> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock();
        Ok(self.settle(&slot, &mut record, ProposalOutcome::Aborted(AbortReason::Cancelled)))
    }

    fn slots(&self) -> Vec<Arc<ProposalSlot>> {
        self.proposals.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Abort every pending proposal with `reason`; returns how many were aborted.
    pub fn abort_pending(&self, reason: AbortReason) -> usize {
        self.slots()
            .iter()
            .filter(|slot| {
                let mut record = slot.record.lock();
                self.settle(slot, &mut record, ProposalOutcome::Aborted(reason))
            })
            .count()
    }

    /// Time out every proposal whose deadline has passed.
    pub fn expire(&self, now: Instant) -> Vec<ProposalId> {
        let mut expired: Vec<ProposalId> = self
            .slots()
            .iter()
            .filter(|slot| self.expire_slot(slot, now))
            .map(|slot| slot.record.lock().proposal.id)
            .collect();
        expired.sort();
        expired
    }

    /// Drop proposals decided more than `retention` before `now`.
    pub fn gc(&self, now: Instant, retention: Duration) -> usize {
        let before = self.proposals.len();
        self.proposals.retain(|_, slot| match slot.record.lock().decided {
            Some(decided) => now.saturating_duration_since(decided) < retention,
            None => true,
        });
        let removed = before.saturating_sub(self.proposals.len());
        if removed > 0 {
            debug!(removed, "Garbage-collected decided proposals");
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| !slot.record.lock().proposal.outcome.is_decided())
            .count()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::domain::swarm_config::SwarmConfig;
    use serde_json::json;

    fn swarm(n: usize, threshold: f64) -> Swarm {
        let config = SwarmConfig {
            consensus_threshold: threshold,
            ..Default::default()
        };
        let mut swarm = Swarm::from_config(&config);
        for _ in 0..n {
            swarm.add_member(AgentId::new());
        }
        swarm
    }

    fn draft(proposer: AgentId) -> ProposalDraft {
        ProposalDraft {
            id: ProposalId::new(),
            proposer,
            payload: json!({"scale_to": 5}),
            delivered_to: BTreeSet::new(),
            clock: VectorClock::new(),
        }
    }

    fn coordinator() -> ConsensusCoordinator {
        ConsensusCoordinator::new(Duration::from_secs(5), EventBus::new(64))
    }

    #[tokio::test]
    async fn test_commit_and_late_vote() {
        let coordinator = coordinator();
        let swarm = swarm(3, 0.7);
        let m = swarm.members.clone();
        let proposal = coordinator.propose(&swarm, draft(m[0])).unwrap();
        assert_eq!(proposal.required, 3);

        assert_eq!(coordinator.vote(proposal.id, m[0], true).unwrap(), ProposalOutcome::Pending);
        assert_eq!(coordinator.vote(proposal.id, m[1], true).unwrap(), ProposalOutcome::Pending);
        assert!(coordinator.vote(proposal.id, m[2], true).unwrap().is_committed());
        assert!(matches!(
            coordinator.vote(proposal.id, m[2], true),
            Err(SwarmError::LateVote(_))
        ));
        assert!(coordinator.await_outcome(proposal.id).await.unwrap().is_committed());
    }

    #[test]
    fn test_non_member_cannot_propose_or_vote() {
        let coordinator = coordinator();
        let swarm = swarm(2, 0.5);
        assert!(matches!(
            coordinator.propose(&swarm, draft(AgentId::new())),
            Err(SwarmError::NotEligible { .. })
        ));
        let proposal = coordinator.propose(&swarm, draft(swarm.members[0])).unwrap();
        assert!(matches!(
            coordinator.vote(proposal.id, AgentId::new(), true),
            Err(SwarmError::NotEligible { .. })
        ));
        assert!(matches!(
            coordinator.vote(ProposalId::new(), swarm.members[0], true),
            Err(SwarmError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_outcome_times_out() {
        let coordinator = coordinator();
        let swarm = swarm(3, 1.0);
        let proposal = coordinator.propose(&swarm, draft(swarm.members[0])).unwrap();
        coordinator.vote(proposal.id, swarm.members[0], true).unwrap();

        let result = coordinator.await_outcome(proposal.id).await;
        assert!(matches!(result, Err(SwarmError::ConsensusTimeout(_))));
        assert_eq!(
            coordinator.outcome(proposal.id).unwrap(),
            ProposalOutcome::Aborted(AbortReason::Timeout)
        );
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_outcome_wakes_on_decision() {
        let coordinator = Arc::new(coordinator());
        let swarm = swarm(2, 1.0);
        let proposal = coordinator.propose(&swarm, draft(swarm.members[0])).unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.await_outcome(proposal.id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.vote(proposal.id, swarm.members[0], true).unwrap();
        coordinator.vote(proposal.id, swarm.members[1], false).unwrap();

        assert_eq!(
            waiter.await.unwrap().unwrap(),
            ProposalOutcome::Aborted(AbortReason::Rejected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_and_gc() {
        let coordinator = coordinator();
        let swarm = swarm(2, 1.0);
        let stale = coordinator.propose(&swarm, draft(swarm.members[0])).unwrap();

        assert!(coordinator.expire(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(coordinator.expire(Instant::now()), vec![stale.id]);

        assert_eq!(coordinator.gc(Instant::now(), Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(coordinator.gc(Instant::now(), Duration::from_secs(60)), 1);
        assert!(coordinator.is_empty());
    }

    #[test]
    fn test_abort_pending_and_cancel() {
        let coordinator = coordinator();
        let swarm = swarm(3, 0.5);
        let a = coordinator.propose(&swarm, draft(swarm.members[0])).unwrap();
        let b = coordinator.propose(&swarm, draft(swarm.members[1])).unwrap();
        assert!(coordinator.cancel(a.id).unwrap());
        assert!(!coordinator.cancel(a.id).unwrap());

        assert_eq!(coordinator.abort_pending(AbortReason::Reconfigured), 1);
        assert_eq!(
            coordinator.outcome(b.id).unwrap(),
            ProposalOutcome::Aborted(AbortReason::Reconfigured)
        );
    }
}
