// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Application Layer
//!
//! Stateful services built on the domain types. [`orchestrator`] composes
//! them; the others can be driven on their own in tests.

pub mod causal;
pub mod consensus;
pub mod heartbeat;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod snapshot;

pub use causal::{CausalDelivery, CausalUpdate, SwarmUpdate};
pub use consensus::{ConsensusCoordinator, ProposalDraft};
pub use heartbeat::HeartbeatMonitor;
pub use ledger::{DeadlockResolution, ResourceLedger};
pub use orchestrator::{MaintenanceReport, SwarmOrchestrator, SwarmOrchestratorBuilder};
pub use registry::{AgentFilter, AgentRegistry, RegistrySettings};
pub use router::{Destination, ReconfigureReport, TopologyRouter};
pub use scheduler::{CancelOutcome, Cancellation, FailOutcome, QueueStats, Settlement, TaskQueue};
pub use snapshot::SnapshotWriter;
