// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** In-process adapters for the domain contracts
//!
//! - [`event_bus`]: broadcast pub/sub for domain events
//! - [`repositories`]: in-memory [`crate::domain::repository::StateStore`]
//! - [`runtime`]: in-process [`crate::domain::runtime::AgentRuntime`]

pub mod event_bus;
pub mod repositories;
pub mod runtime;
