// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use aegis_core::domain::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A granted resource lock.
///
/// Only one agent may hold a `ResourceLock` for a given `resource_id` at a time.
/// Locks are released explicitly, on task cancellation, or when the holder is
/// lost; deadlock resolution may also force-release one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Opaque identifier for the locked resource (e.g. file path, DB row key).
    pub resource_id: String,
    /// The agent currently holding the lock.
    pub held_by: AgentId,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Agents queued behind the holder, in grant order.
    pub waiters: Vec<AgentId>,
}
