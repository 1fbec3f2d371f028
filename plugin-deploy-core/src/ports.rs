//! Port traits for the collaborators a reconciliation pass talks to.
//! The engine depends only on these; `store_memory` provides in-process
//! implementations.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::batch::{BatchItem, BatchResult};
use crate::state::LifecycleState;
use crate::types::{ArtifactRecord, OwnedArtifact, ProcessKey};

/// A deployed process definition as the registry reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub definition_id: String,
    pub key: ProcessKey,
    /// Deployment counter per key. The highest revision is the current one.
    pub revision: u32,
    pub suspended: bool,
}

/// The workflow engine's process registry.
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Deploy a process model and return the id of the resulting definition.
    async fn deploy(&self, key: &ProcessKey, model: &[u8], tenant_tag: &str) -> Result<String>;

    /// Every definition ever deployed, across all prior plugin sets.
    async fn list_known_process_definitions(&self) -> Result<Vec<ProcessDefinition>>;

    async fn activate(&self, definition_id: &str) -> Result<()>;
    async fn suspend(&self, definition_id: &str) -> Result<()>;
}

/// Durable reconciliation state. Read once at pass start, written once at
/// pass end.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_process_states(&self) -> Result<BTreeMap<ProcessKey, LifecycleState>>;

    /// Overwrites the complete map.
    async fn update_process_states(
        &self,
        states: &BTreeMap<ProcessKey, LifecycleState>,
    ) -> Result<()>;

    async fn get_artifact_records(&self) -> Result<BTreeMap<ProcessKey, Vec<ArtifactRecord>>>;

    async fn add_or_remove_artifacts(
        &self,
        merged: &[OwnedArtifact],
        deleted_ids: &[Uuid],
        excluded_keys: &[ProcessKey],
    ) -> Result<()>;

    /// Persist a completed pass: artifact records, then the process state
    /// map. Stores with transactions should override this to write both at
    /// once.
    async fn commit_pass(
        &self,
        merged: &[OwnedArtifact],
        deleted_ids: &[Uuid],
        excluded_keys: &[ProcessKey],
        states: &BTreeMap<ProcessKey, LifecycleState>,
    ) -> Result<()> {
        self.add_or_remove_artifacts(merged, deleted_ids, excluded_keys)
            .await?;
        self.update_process_states(states).await
    }
}

/// The remote artifact store.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Execute all items as one request. Results are returned in request
    /// order. Mutating items are applied all-or-nothing.
    async fn execute_batch(&self, items: &[BatchItem]) -> Result<Vec<BatchResult>>;
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for std::sync::Arc<S> {
    async fn execute_batch(&self, items: &[BatchItem]) -> Result<Vec<BatchResult>> {
        (**self).execute_batch(items).await
    }
}
