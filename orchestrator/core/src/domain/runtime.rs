// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::agent::{AgentId, AgentProfile};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque provisioner handle for a launched agent runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to launch instance: {0}")]
    LaunchFailed(String),
    #[error("Failed to terminate instance: {0}")]
    TerminationFailed(String),
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl RuntimeError {
    /// Permission failures will not succeed on retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::PermissionDenied(_))
    }
}

/// Agent process/execution provisioner.
///
/// How an agent actually runs (container, process, remote worker) is outside
/// the engine; the registry only launches and tears down.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn launch(&self, agent_id: AgentId, profile: &AgentProfile) -> Result<InstanceId, RuntimeError>;
    async fn terminate(&self, instance: &InstanceId) -> Result<(), RuntimeError>;
}
