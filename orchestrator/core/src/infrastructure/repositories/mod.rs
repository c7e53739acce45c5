// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! State Store Implementations
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve engine snapshots
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! Only the in-memory store ships here; durable backends implement
//! [`StateStore`] out of tree.

use crate::domain::repository::{EntityKind, RepositoryError, StateStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thread-safe map-backed [`StateStore`].
///
/// Clones share storage.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    entries: Arc<RwLock<BTreeMap<(EntityKind, String), serde_json::Value>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `persist`/`delete` calls fail (for exercising write-behind tolerance).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.entries.read().keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Storage("store is rejecting writes".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn persist(&self, kind: EntityKind, id: &str, snapshot: serde_json::Value) -> Result<(), RepositoryError> {
        self.check_writable()?;
        self.entries.write().insert((kind, id.to_string()), snapshot);
        Ok(())
    }

    async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        Ok(self.entries.read().get(&(kind, id.to_string())).cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>, RepositoryError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RepositoryError> {
        self.check_writable()?;
        self.entries.write().remove(&(kind, id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_persist_load_list_delete() {
        let store = InMemoryStateStore::new();
        store.persist(EntityKind::Task, "t1", json!({"n": 1})).await.unwrap();
        store.persist(EntityKind::Task, "t2", json!({"n": 2})).await.unwrap();
        store.persist(EntityKind::Agent, "a1", json!({"n": 3})).await.unwrap();

        assert_eq!(store.load(EntityKind::Task, "t1").await.unwrap(), Some(json!({"n": 1})));
        assert!(store.load(EntityKind::Agent, "t1").await.unwrap().is_none());
        assert_eq!(store.list(EntityKind::Task).await.unwrap().len(), 2);

        store.delete(EntityKind::Task, "t1").await.unwrap();
        assert_eq!(store.len(EntityKind::Task), 1);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = InMemoryStateStore::new();
        store.set_fail_writes(true);
        let err = store.persist(EntityKind::Proposal, "p", json!(null)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
        assert!(store.is_empty());
    }
}
