// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-core`: Swarm Engine Domain Primitives
//!
//! Shared vocabulary for the swarm engine: agents, tasks, swarm identity and
//! topology, domain events, and the narrow collaborator contracts (runtime
//! provisioner, transition hooks, state store).
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain types plus in-memory infrastructure adapters

pub mod domain;
pub mod infrastructure;

pub use domain::*;
