// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-process agent runtime.
//
// Agents launched here have no process of their own; the caller drives
// them directly (tests, the CLI simulator). Launch failures can be
// injected to exercise the registry's retry path.

use crate::domain::agent::{AgentId, AgentProfile};
use crate::domain::runtime::{AgentRuntime, InstanceId, RuntimeError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct InProcessRuntime {
    instances: Arc<Mutex<HashMap<InstanceId, AgentId>>>,
    pending_failures: Arc<AtomicU32>,
    launches: Arc<AtomicU32>,
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` launch attempts.
    pub fn with_launch_failures(self, n: u32) -> Self {
        self.pending_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn active_instances(&self) -> usize {
        self.instances.lock().len()
    }

    /// Launch attempts so far, failed ones included
    pub fn launch_attempts(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntime for InProcessRuntime {
    async fn launch(&self, agent_id: AgentId, profile: &AgentProfile) -> Result<InstanceId, RuntimeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(agent_id = %agent_id, "Injected launch failure");
            return Err(RuntimeError::LaunchFailed(format!("injected failure for '{}'", profile.name)));
        }

        let instance = InstanceId::new(format!("inproc-{}", agent_id));
        self.instances.lock().insert(instance.clone(), agent_id);
        info!(agent_id = %agent_id, instance = %instance, "Launched in-process agent '{}'", profile.name);
        Ok(instance)
    }

    async fn terminate(&self, instance: &InstanceId) -> Result<(), RuntimeError> {
        match self.instances.lock().remove(instance) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::InstanceNotFound(instance.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let runtime = InProcessRuntime::new();
        let profile = AgentProfile::new("w", "coder");
        let instance = runtime.launch(AgentId::new(), &profile).await.unwrap();
        assert_eq!(runtime.active_instances(), 1);

        runtime.terminate(&instance).await.unwrap();
        assert_eq!(runtime.active_instances(), 0);
        assert!(matches!(
            runtime.terminate(&instance).await,
            Err(RuntimeError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let runtime = InProcessRuntime::new().with_launch_failures(2);
        let profile = AgentProfile::new("w", "coder");
        assert!(runtime.launch(AgentId::new(), &profile).await.is_err());
        assert!(runtime.launch(AgentId::new(), &profile).await.is_err());
        assert!(runtime.launch(AgentId::new(), &profile).await.is_ok());
        assert_eq!(runtime.launch_attempts(), 3);
    }
}
