// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Aggregates, value objects and collaborator contracts

pub mod agent;
pub mod events;
pub mod hooks;
pub mod repository;
pub mod runtime;
pub mod swarm;
pub mod swarm_config;
pub mod task;
