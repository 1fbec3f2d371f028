//! In-memory implementations of the three ports, for tests, dry runs and
//! local development.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::batch::{BatchItem, BatchResult};
use crate::ports::{ProcessDefinition, ProcessRegistry, ResourceStore, StateStore};
use crate::state::LifecycleState;
use crate::types::{ArtifactIdentity, ArtifactRecord, OwnedArtifact, ProcessKey};

// ── MemoryProcessRegistry ──

#[derive(Debug, Clone)]
struct Deployment {
    definition: ProcessDefinition,
    model: Vec<u8>,
    tenant_tag: String,
}

/// In-memory process registry.
///
/// Deploying a model identical to the key's current definition is a no-op
/// that returns the existing definition id; anything else creates a new
/// revision.
pub struct MemoryProcessRegistry {
    inner: RwLock<Vec<Deployment>>,
}

impl MemoryProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    /// Seed with definitions deployed before this process started.
    pub fn with_definitions(definitions: Vec<ProcessDefinition>) -> Self {
        let deployments = definitions
            .into_iter()
            .map(|definition| Deployment {
                definition,
                model: Vec::new(),
                tenant_tag: String::new(),
            })
            .collect();
        Self {
            inner: RwLock::new(deployments),
        }
    }

    pub fn definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.iter().map(|d| d.definition.clone()).collect())
    }

    /// Tenant tag of a deployed definition.
    pub fn tenant_of(&self, definition_id: &str) -> Result<Option<String>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner
            .iter()
            .find(|d| d.definition.definition_id == definition_id)
            .map(|d| d.tenant_tag.clone()))
    }

    fn set_suspended(&self, definition_id: &str, suspended: bool) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let deployment = inner
            .iter_mut()
            .find(|d| d.definition.definition_id == definition_id)
            .ok_or_else(|| anyhow!("Process definition not found: {}", definition_id))?;
        deployment.definition.suspended = suspended;
        Ok(())
    }
}

impl Default for MemoryProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRegistry for MemoryProcessRegistry {
    async fn deploy(&self, key: &ProcessKey, model: &[u8], tenant_tag: &str) -> Result<String> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;

        let current = inner
            .iter()
            .filter(|d| &d.definition.key == key)
            .max_by_key(|d| d.definition.revision);
        if let Some(current) = current {
            if current.model == model {
                return Ok(current.definition.definition_id.clone());
            }
        }

        let revision = current.map(|d| d.definition.revision + 1).unwrap_or(1);
        let definition = ProcessDefinition {
            definition_id: format!("{}:{}:{}", key.id, key.version, revision),
            key: key.clone(),
            revision,
            suspended: false,
        };
        let definition_id = definition.definition_id.clone();
        inner.push(Deployment {
            definition,
            model: model.to_vec(),
            tenant_tag: tenant_tag.to_string(),
        });
        Ok(definition_id)
    }

    async fn list_known_process_definitions(&self) -> Result<Vec<ProcessDefinition>> {
        self.definitions()
    }

    async fn activate(&self, definition_id: &str) -> Result<()> {
        self.set_suspended(definition_id, false)
    }

    async fn suspend(&self, definition_id: &str) -> Result<()> {
        self.set_suspended(definition_id, true)
    }
}

// ── MemoryStateStore ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub process_states: BTreeMap<ProcessKey, LifecycleState>,
    #[serde(default)]
    pub artifacts: BTreeMap<ProcessKey, Vec<ArtifactRecord>>,
}

impl StateSnapshot {
    fn apply_artifacts(
        &mut self,
        merged: &[OwnedArtifact],
        deleted_ids: &[Uuid],
        excluded_keys: &[ProcessKey],
    ) {
        let mut rebuilt: BTreeMap<ProcessKey, Vec<ArtifactRecord>> = BTreeMap::new();
        for artifact in merged {
            for owner in &artifact.owning_processes {
                let records = rebuilt.entry(owner.clone()).or_default();
                if let Some(store_id) = artifact.store_id {
                    records.push(ArtifactRecord {
                        identity: artifact.identity.clone(),
                        store_id,
                    });
                }
            }
        }

        let deleted: BTreeSet<&Uuid> = deleted_ids.iter().collect();
        self.artifacts = rebuilt;
        for records in self.artifacts.values_mut() {
            records.retain(|r| !deleted.contains(&r.store_id));
        }
        for key in excluded_keys {
            self.artifacts.remove(key);
        }
        self.artifacts.retain(|_, records| !records.is_empty());
    }
}

/// In-memory reconciliation state store.
pub struct MemoryStateStore {
    inner: RwLock<StateSnapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::from_snapshot(StateSnapshot::default())
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> Result<StateSnapshot> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.clone())
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_process_states(&self) -> Result<BTreeMap<ProcessKey, LifecycleState>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.process_states.clone())
    }

    async fn update_process_states(
        &self,
        states: &BTreeMap<ProcessKey, LifecycleState>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.process_states = states.clone();
        Ok(())
    }

    async fn get_artifact_records(&self) -> Result<BTreeMap<ProcessKey, Vec<ArtifactRecord>>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.artifacts.clone())
    }

    /// `merged` covers every key of the pass, so the records are rebuilt
    /// from it: each owner keeps the merged artifacts that carry a store
    /// id. Deleted ids are then dropped and excluded keys forgotten.
    async fn add_or_remove_artifacts(
        &self,
        merged: &[OwnedArtifact],
        deleted_ids: &[Uuid],
        excluded_keys: &[ProcessKey],
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.apply_artifacts(merged, deleted_ids, excluded_keys);
        Ok(())
    }

    /// Both maps are replaced under one lock.
    async fn commit_pass(
        &self,
        merged: &[OwnedArtifact],
        deleted_ids: &[Uuid],
        excluded_keys: &[ProcessKey],
        states: &BTreeMap<ProcessKey, LifecycleState>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.apply_artifacts(merged, deleted_ids, excluded_keys);
        inner.process_states = states.clone();
        Ok(())
    }
}

// ── MemoryResourceStore ──

#[derive(Debug, Clone)]
struct StoredResource {
    id: Uuid,
    version: u32,
    resource: serde_json::Value,
}

impl StoredResource {
    fn location(&self, identity: &ArtifactIdentity) -> String {
        format!("{}/{}/_history/{}", identity.kind(), self.id, self.version)
    }
}

/// In-memory artifact store.
///
/// Evaluates conditional writes by natural key. Mutations of one batch are
/// applied to a copy and committed together, so a failed batch leaves the
/// store untouched.
pub struct MemoryResourceStore {
    inner: RwLock<BTreeMap<ArtifactIdentity, StoredResource>>,
    history: Mutex<Vec<Vec<BatchItem>>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Store a resource directly, bypassing batches. Returns its id.
    pub fn insert(&self, identity: ArtifactIdentity, resource: serde_json::Value) -> Result<Uuid> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let id = Uuid::now_v7();
        inner.insert(
            identity,
            StoredResource {
                id,
                version: 1,
                resource,
            },
        );
        Ok(id)
    }

    /// Delete a resource out-of-band.
    pub fn remove(&self, identity: &ArtifactIdentity) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.remove(identity).is_some())
    }

    pub fn get(&self, identity: &ArtifactIdentity) -> Result<Option<(Uuid, serde_json::Value)>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.get(identity).map(|r| (r.id, r.resource.clone())))
    }

    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every batch executed so far, in order.
    pub fn history(&self) -> Result<Vec<Vec<BatchItem>>> {
        let history = self.history.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(history.clone())
    }

    /// Reject the next batch as a whole, as a failed transaction would.
    pub fn fail_next_batch(&self, message: impl Into<String>) -> Result<()> {
        let mut fail = self.fail_next.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        *fail = Some(message.into());
        Ok(())
    }
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn execute_batch(&self, items: &[BatchItem]) -> Result<Vec<BatchResult>> {
        self.history
            .lock()
            .map_err(|e| anyhow!("Lock: {}", e))?
            .push(items.to_vec());

        if let Some(message) = self
            .fail_next
            .lock()
            .map_err(|e| anyhow!("Lock: {}", e))?
            .take()
        {
            return Err(anyhow!("Batch rejected: {}", message));
        }

        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut working = store.clone();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let result = match item {
                BatchItem::ConditionalCreate { identity, resource } => match working.get(identity) {
                    Some(existing) => BatchResult::with_location(200, existing.location(identity)),
                    None => {
                        let created = StoredResource {
                            id: Uuid::now_v7(),
                            version: 1,
                            resource: resource.clone(),
                        };
                        let location = created.location(identity);
                        working.insert(identity.clone(), created);
                        BatchResult::with_location(201, location)
                    }
                },
                BatchItem::ConditionalUpdate { identity, resource } => {
                    match working.get_mut(identity) {
                        Some(existing) => {
                            existing.version += 1;
                            existing.resource = resource.clone();
                            BatchResult::with_location(200, existing.location(identity))
                        }
                        None => {
                            let created = StoredResource {
                                id: Uuid::now_v7(),
                                version: 1,
                                resource: resource.clone(),
                            };
                            let location = created.location(identity);
                            working.insert(identity.clone(), created);
                            BatchResult::with_location(201, location)
                        }
                    }
                }
                BatchItem::ConditionalDelete { identity } => match working.remove(identity) {
                    Some(_) => BatchResult::status(204),
                    None => BatchResult::status(200),
                },
                BatchItem::CountQuery { identity } => {
                    let total = u64::from(working.contains_key(identity));
                    BatchResult {
                        status: 200,
                        location: None,
                        payload: Some(json!({
                            "resourceType": "Bundle",
                            "type": "searchset",
                            "total": total
                        })),
                    }
                }
                BatchItem::Read { identity } => {
                    let entries: Vec<serde_json::Value> = working
                        .get(identity)
                        .map(|r| json!({"resource": r.resource}))
                        .into_iter()
                        .collect();
                    BatchResult {
                        status: 200,
                        location: None,
                        payload: Some(json!({
                            "resourceType": "Bundle",
                            "type": "searchset",
                            "total": entries.len(),
                            "entry": entries
                        })),
                    }
                }
            };
            results.push(result);
        }

        *store = working;
        Ok(results)
    }
}
