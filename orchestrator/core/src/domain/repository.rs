// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Durable State Store Contract
//!
//! Write-behind persistence for engine entities. The engine snapshots agents,
//! tasks and proposals here after each committed mutation and reloads tasks
//! on restart; it never depends on the store for correctness, so a failing
//! store only costs durability.
//!
//! | Kind | Key | Snapshot |
//! |------|-----|----------|
//! | `agents` | `AgentId` | `Agent` |
//! | `tasks` | `TaskId` | `Task` |
//! | `proposals` | `ProposalId` | proposal record (short TTL) |
//!
//! Implemented in `crate::infrastructure::repositories`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Task,
    Proposal,
}

impl EntityKind {
    /// Logical table name
    pub fn table(self) -> &'static str {
        match self {
            Self::Agent => "agents",
            Self::Task => "tasks",
            Self::Proposal => "proposals",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or overwrite the snapshot for `id`
    async fn persist(&self, kind: EntityKind, id: &str, snapshot: serde_json::Value) -> Result<(), RepositoryError>;

    async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<serde_json::Value>, RepositoryError>;

    /// All snapshots of `kind`, in key order
    async fn list(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>, RepositoryError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
