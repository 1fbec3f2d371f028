//! Snapshot file: everything needed to seed the in-memory collaborators
//! for an offline plan.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use plugin_deploy_core::ports::ProcessDefinition;
use plugin_deploy_core::store_memory::{
    MemoryProcessRegistry, MemoryResourceStore, MemoryStateStore, StateSnapshot,
};
use plugin_deploy_core::{ArtifactIdentity, ProcessPlugin};

/// A resource already present in the artifact store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredResource {
    pub identity: ArtifactIdentity,
    pub resource: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub plugins: Vec<ProcessPlugin>,
    pub state: StateSnapshot,
    pub definitions: Vec<ProcessDefinition>,
    pub resources: Vec<StoredResource>,
}

pub struct Seeded {
    pub plugins: Vec<ProcessPlugin>,
    pub registry: MemoryProcessRegistry,
    pub state: MemoryStateStore,
    pub resources: MemoryResourceStore,
}

impl Snapshot {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn seed(self) -> Result<Seeded> {
        let resources = MemoryResourceStore::new();
        for stored in self.resources {
            resources.insert(stored.identity, stored.resource)?;
        }
        Ok(Seeded {
            plugins: self.plugins,
            registry: MemoryProcessRegistry::with_definitions(self.definitions),
            state: MemoryStateStore::from_snapshot(self.state),
            resources,
        })
    }
}
