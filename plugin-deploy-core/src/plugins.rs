//! The loaded plugin set, flattened per process key.

use std::collections::{BTreeMap, BTreeSet};

use crate::state::KeySets;
use crate::types::{DeclaredArtifact, ProcessKey, ProcessPlugin};

/// A process model ready to be handed to the registry.
#[derive(Debug, Clone)]
pub struct LoadedProcess {
    pub key: ProcessKey,
    pub plugin: String,
    pub draft: bool,
    pub model: String,
}

/// Every valid process of the current plugin set.
#[derive(Debug, Clone, Default)]
pub struct LoadedPlugins {
    pub processes: Vec<LoadedProcess>,
    pub declared: BTreeMap<ProcessKey, Vec<DeclaredArtifact>>,
}

impl LoadedPlugins {
    /// Flatten plugins into processes. A key shipped by more than one plugin
    /// is ambiguous; every copy is dropped, which excludes the key.
    pub fn from_plugins(plugins: &[ProcessPlugin]) -> Self {
        let mut owners: BTreeMap<&ProcessKey, Vec<&str>> = BTreeMap::new();
        for plugin in plugins {
            for process in &plugin.processes {
                owners.entry(&process.key).or_default().push(&plugin.name);
            }
        }

        let ambiguous: BTreeSet<&ProcessKey> = owners
            .iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(key, names)| {
                tracing::warn!(
                    "process {} is defined by {} plugins ({}), excluding it",
                    key,
                    names.len(),
                    names.join(", ")
                );
                *key
            })
            .collect();

        let mut loaded = LoadedPlugins::default();
        for plugin in plugins {
            for process in &plugin.processes {
                if ambiguous.contains(&process.key) {
                    continue;
                }
                loaded.processes.push(LoadedProcess {
                    key: process.key.clone(),
                    plugin: format!("{}-{}", plugin.name, plugin.version),
                    draft: plugin.draft,
                    model: process.model.clone(),
                });
                loaded
                    .declared
                    .insert(process.key.clone(), process.artifacts.clone());
            }
        }
        loaded
    }

    /// Key sets for state resolution, with the configured exclude and retire
    /// lists.
    pub fn key_sets(
        &self,
        excluded: impl IntoIterator<Item = ProcessKey>,
        retired: impl IntoIterator<Item = ProcessKey>,
    ) -> KeySets {
        KeySets {
            loaded: self.processes.iter().map(|p| p.key.clone()).collect(),
            draft: self
                .processes
                .iter()
                .filter(|p| p.draft)
                .map(|p| p.key.clone())
                .collect(),
            excluded: excluded.into_iter().collect(),
            retired: retired.into_iter().collect(),
        }
    }
}
