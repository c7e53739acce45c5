// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure domain types for multi-agent coordination. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`swarm`] | `Swarm`, `SwarmStatus` |
//! | [`topology`] | `neighbors`, `adjacency`, `next_hop`, `validate` |
//! | [`proposal`] | `Proposal`, `ProposalOutcome`, `AbortReason` |
//! | [`lock`] | `ResourceLock` |
//! | [`clock`] | `VectorClock` |

pub mod clock;
pub mod lock;
pub mod proposal;
pub mod swarm;
pub mod topology;

pub use clock::VectorClock;
pub use lock::ResourceLock;
pub use proposal::{AbortReason, Proposal, ProposalOutcome, VoteReceipt};
pub use swarm::{Swarm, SwarmStatus};
