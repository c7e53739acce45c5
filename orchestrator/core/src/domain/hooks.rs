// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Transition hook pipeline contract.
//!
//! Hooks are injected at construction time. Pre-hooks run inline before an
//! agent transition is committed and can veto it; post-hooks are delivered
//! asynchronously after the fact and can only observe.

use crate::domain::agent::{AgentEvent, AgentId, AgentState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An agent state change about to happen (pre-hook) or that happened (post-hook).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub agent_id: AgentId,
    pub event: AgentEvent,
    pub from: AgentState,
    pub to: AgentState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookDecision {
    Allow,
    Deny(String),
}

impl HookDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[async_trait]
pub trait TransitionHook: Send + Sync {
    /// Name used in logs when the hook denies or misbehaves
    fn name(&self) -> &str;

    async fn before_transition(&self, _event: &TransitionEvent) -> HookDecision {
        HookDecision::Allow
    }

    async fn after_transition(&self, _event: &TransitionEvent) {}
}
