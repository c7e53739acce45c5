// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Write-behind persistence of agent, task and proposal snapshots.
//!
//! A store failure never fails the operation that produced the snapshot; it
//! is logged and counted.

use crate::domain::proposal::Proposal;
use aegis_core::domain::agent::Agent;
use aegis_core::domain::repository::{EntityKind, RepositoryError, StateStore};
use aegis_core::domain::task::Task;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Default)]
pub struct SnapshotWriter {
    store: Option<Arc<dyn StateStore>>,
}

impl SnapshotWriter {
    pub fn new(store: Option<Arc<dyn StateStore>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Option<&Arc<dyn StateStore>> {
        self.store.as_ref()
    }

    pub async fn agent(&self, agent: &Agent) {
        self.persist(EntityKind::Agent, &agent.id.to_string(), agent).await;
    }

    pub async fn task(&self, task: &Task) {
        self.persist(EntityKind::Task, &task.id.to_string(), task).await;
    }

    pub async fn proposal(&self, proposal: &Proposal) {
        self.persist(EntityKind::Proposal, &proposal.id.to_string(), proposal)
            .await;
    }

    pub async fn remove(&self, kind: EntityKind, id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete(kind, id).await {
            Self::report(kind, id, &e);
        }
    }

    async fn persist<T: Serialize>(&self, kind: EntityKind, id: &str, entity: &T) {
        let Some(store) = &self.store else {
            return;
        };
        let result = match serde_json::to_value(entity) {
            Ok(snapshot) => store.persist(kind, id, snapshot).await,
            Err(e) => Err(RepositoryError::from(e)),
        };
        if let Err(e) = result {
            Self::report(kind, id, &e);
        }
    }

    fn report(kind: EntityKind, id: &str, error: &RepositoryError) {
        warn!(kind = %kind, id, "Snapshot write failed: {}", error);
        metrics::counter!("aegis_swarm_persist_failures_total", "kind" => kind.table()).increment(1);
    }

    /// Every stored task; unreadable snapshots are skipped.
    pub async fn load_tasks(&self) -> Result<Vec<Task>, RepositoryError> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let snapshots = store.list(EntityKind::Task).await?;
        let mut tasks = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            match serde_json::from_value::<Task>(snapshot) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping unreadable task snapshot: {}", e),
            }
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::domain::task::TaskSpec;
    use aegis_core::infrastructure::repositories::InMemoryStateStore;

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let store = InMemoryStateStore::default();
        let writer = SnapshotWriter::new(Some(Arc::new(store.clone())));
        let task = Task::from_spec(TaskSpec::new("index repo"), 1);

        writer.task(&task).await;
        let loaded = writer.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, task.id);

        writer.remove(EntityKind::Task, &task.id.to_string()).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failures_are_swallowed() {
        let store = InMemoryStateStore::default();
        store.set_fail_writes(true);
        let writer = SnapshotWriter::new(Some(Arc::new(store.clone())));
        writer.task(&Task::from_spec(TaskSpec::new("x"), 1)).await;
        assert_eq!(store.len(EntityKind::Task), 0);
    }

    #[tokio::test]
    async fn test_without_store_is_a_no_op() {
        let writer = SnapshotWriter::default();
        writer.task(&Task::from_spec(TaskSpec::new("x"), 1)).await;
        assert!(writer.load_tasks().await.unwrap().is_empty());
    }
}
