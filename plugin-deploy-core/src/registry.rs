//! Process registry reconciler.
//!
//! Resolves the new lifecycle state of every process key the registry has
//! ever seen and activates or suspends definitions accordingly.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{DeployError, Result};
use crate::plugins::LoadedPlugins;
use crate::ports::{ProcessDefinition, ProcessRegistry, StateStore};
use crate::state::{resolve_new_state, KeySets, LifecycleState, StateChange};
use crate::types::ProcessKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Activate,
    Suspend,
}

/// Registry side effect of a transition. Unlisted pairs are a no-op.
pub fn registry_action(old: LifecycleState, new: LifecycleState) -> Option<RegistryAction> {
    use LifecycleState::*;

    match (old, new) {
        (New | Active | Draft, Retired | Excluded) => Some(RegistryAction::Suspend),
        (Retired | Excluded, Active | Draft) => Some(RegistryAction::Activate),
        _ => None,
    }
}

/// Result of state resolution: the ordered changes and the complete map to
/// persist once the pass succeeds.
#[derive(Debug, Clone, Default)]
pub struct RegistryReconciliation {
    pub changes: Vec<StateChange>,
    pub new_states: BTreeMap<ProcessKey, LifecycleState>,
}

impl RegistryReconciliation {
    pub fn excluded_keys(&self) -> Vec<ProcessKey> {
        self.changes
            .iter()
            .filter(|c| c.new_state == LifecycleState::Excluded)
            .map(|c| c.key.clone())
            .collect()
    }
}

/// Pure state resolution over `known` keys. Keys absent from `prior` start
/// out as `New`.
pub fn compute_state_changes(
    known: &BTreeSet<ProcessKey>,
    sets: &KeySets,
    prior: &BTreeMap<ProcessKey, LifecycleState>,
) -> RegistryReconciliation {
    let changes: Vec<StateChange> = known
        .iter()
        .map(|key| {
            let old_state = prior.get(key).copied().unwrap_or(LifecycleState::New);
            StateChange::new(key.clone(), old_state, resolve_new_state(key, sets))
        })
        .collect();

    let new_states = changes
        .iter()
        .map(|c| (c.key.clone(), c.new_state))
        .collect();

    RegistryReconciliation {
        changes,
        new_states,
    }
}

/// The definition that activate/suspend act on: highest revision per key.
fn current_definitions(definitions: &[ProcessDefinition]) -> BTreeMap<&ProcessKey, &ProcessDefinition> {
    let mut current: BTreeMap<&ProcessKey, &ProcessDefinition> = BTreeMap::new();
    for def in definitions {
        match current.get(&def.key) {
            Some(existing) if existing.revision >= def.revision => {}
            _ => {
                current.insert(&def.key, def);
            }
        }
    }
    current
}

/// Resolve states for every known key and, unless `dry_run`, issue the
/// registry side effects. Nothing is persisted here.
pub async fn reconcile_registry(
    registry: &dyn ProcessRegistry,
    state: &dyn StateStore,
    sets: &KeySets,
    dry_run: bool,
) -> Result<RegistryReconciliation> {
    let prior = state
        .get_process_states()
        .await
        .map_err(DeployError::StateStore)?;
    let definitions = registry
        .list_known_process_definitions()
        .await
        .map_err(DeployError::Registry)?;

    let known: BTreeSet<ProcessKey> = definitions
        .iter()
        .map(|d| d.key.clone())
        .chain(sets.loaded.iter().cloned())
        .collect();

    let reconciliation = compute_state_changes(&known, sets, &prior);

    if !dry_run {
        apply_registry_actions(registry, &reconciliation.changes, &definitions).await?;
    }

    Ok(reconciliation)
}

async fn apply_registry_actions(
    registry: &dyn ProcessRegistry,
    changes: &[StateChange],
    definitions: &[ProcessDefinition],
) -> Result<()> {
    let current = current_definitions(definitions);

    for change in changes {
        let Some(action) = registry_action(change.old_state, change.new_state) else {
            continue;
        };
        let Some(def) = current.get(&change.key) else {
            tracing::debug!("registry: no definition for {}, skipping {:?}", change.key, action);
            continue;
        };

        match action {
            RegistryAction::Suspend if !def.suspended => {
                tracing::info!(
                    "registry: suspending {} ({} → {})",
                    change.key,
                    change.old_state,
                    change.new_state
                );
                registry
                    .suspend(&def.definition_id)
                    .await
                    .map_err(DeployError::Registry)?;
            }
            RegistryAction::Activate if def.suspended => {
                tracing::info!(
                    "registry: activating {} ({} → {})",
                    change.key,
                    change.old_state,
                    change.new_state
                );
                registry
                    .activate(&def.definition_id)
                    .await
                    .map_err(DeployError::Registry)?;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Deploy every loaded model, then suspend all but the newest definition of
/// each draft key so only one draft revision runs.
pub async fn deploy_models(
    registry: &dyn ProcessRegistry,
    loaded: &LoadedPlugins,
    tenant_tag: &str,
) -> Result<()> {
    for process in &loaded.processes {
        let definition_id = registry
            .deploy(&process.key, process.model.as_bytes(), tenant_tag)
            .await
            .map_err(DeployError::Registry)?;
        tracing::debug!(
            "registry: deployed {} from {} as {}",
            process.key,
            process.plugin,
            definition_id
        );
    }

    let draft_keys: BTreeSet<&ProcessKey> = loaded
        .processes
        .iter()
        .filter(|p| p.draft)
        .map(|p| &p.key)
        .collect();
    if draft_keys.is_empty() {
        return Ok(());
    }

    let definitions = registry
        .list_known_process_definitions()
        .await
        .map_err(DeployError::Registry)?;
    let current = current_definitions(&definitions);

    for def in &definitions {
        if !draft_keys.contains(&def.key) || def.suspended {
            continue;
        }
        let is_current = current
            .get(&def.key)
            .is_some_and(|c| c.definition_id == def.definition_id);
        if !is_current {
            tracing::debug!(
                "registry: suspending superseded draft {} revision {}",
                def.key,
                def.revision
            );
            registry
                .suspend(&def.definition_id)
                .await
                .map_err(DeployError::Registry)?;
        }
    }

    Ok(())
}
