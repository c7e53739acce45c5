// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-swarm`: Swarm Orchestration & Scheduling Engine
//!
//! Coordinates a bounded pool of agents executing prioritized tasks under a
//! shared topology, with quorum agreement and resource locking.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `Swarm`, `Proposal`, `ResourceLock`, `VectorClock`, topology rules |
//! | [`application`] | Application | `AgentRegistry`, `TaskQueue`, `TopologyRouter`, `ConsensusCoordinator`, `CausalDelivery`, `ResourceLedger`, `HeartbeatMonitor`, `SwarmOrchestrator` |
//! | [`error`] | - | `SwarmError` taxonomy |
//!
//! ## Key Concepts
//!
//! - **Admission control**: live agents and non-terminal tasks are bounded;
//!   exceeding either bound is reported synchronously as backpressure.
//! - **Early decide**: a proposal commits or aborts as soon as the outcome is
//!   arithmetically fixed, without waiting for stragglers.
//! - **Deadlock sweep**: the maintenance loop breaks wait-for cycles by
//!   force-releasing one lock per cycle.
//!
//! All components are in-memory; durability is delegated to an injected
//! [`aegis_core::domain::repository::StateStore`].

pub mod application;
pub mod domain;
pub mod error;

pub use application::orchestrator::{SwarmOrchestrator, SwarmOrchestratorBuilder};
pub use domain::*;
pub use error::{SwarmError, SwarmResult};
