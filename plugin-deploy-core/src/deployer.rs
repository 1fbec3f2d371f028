//! Reconciliation pass: deploy models, resolve process states, merge and
//! heal artifact ownership, apply one batch, persist once.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::apply::{apply_batch, persist_pass};
use crate::batch::{build_batch, Batch};
use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::existence::{fetch_stored_content, verify_existence};
use crate::merge::{merge_artifacts, ArtifactMap, MergeInput};
use crate::plugins::LoadedPlugins;
use crate::ports::{ProcessRegistry, ResourceStore, StateStore};
use crate::registry::{deploy_models, reconcile_registry, RegistryReconciliation};
use crate::retry::RetryingResourceStore;
use crate::state::StateChange;
use crate::types::ProcessPlugin;

/// Outcome of a completed pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentReport {
    pub changes: Vec<StateChange>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Artifacts found missing from the store and re-created.
    pub healed: usize,
}

/// What a pass would do, computed without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    pub changes: Vec<StateChange>,
    pub healed: usize,
    pub batch: Batch,
}

struct Prepared {
    reconciliation: RegistryReconciliation,
    merged: ArtifactMap,
    healed: usize,
    batch: Batch,
}

/// Runs reconciliation passes against one node's collaborators. At most one
/// pass runs at a time.
pub struct Deployer {
    registry: Arc<dyn ProcessRegistry>,
    state: Arc<dyn StateStore>,
    resources: Arc<dyn ResourceStore>,
    config: DeployConfig,
    pass: Mutex<()>,
}

impl Deployer {
    /// Resource store calls are wrapped in the configured retry policy.
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        state: Arc<dyn StateStore>,
        resources: Arc<dyn ResourceStore>,
        config: DeployConfig,
    ) -> Self {
        let resources: Arc<dyn ResourceStore> =
            Arc::new(RetryingResourceStore::new(resources, config.retry.policy()));
        Self {
            registry,
            state,
            resources,
            config,
            pass: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Run one full pass. Nothing is persisted unless the remote batch
    /// succeeded.
    pub async fn run(&self, plugins: &[ProcessPlugin]) -> Result<DeploymentReport> {
        let _pass = self.pass.try_lock().map_err(|_| DeployError::PassInProgress)?;

        let loaded = LoadedPlugins::from_plugins(plugins);
        tracing::info!(
            "deploy: {} plugin(s), {} process(es) loaded",
            plugins.len(),
            loaded.processes.len()
        );

        deploy_models(self.registry.as_ref(), &loaded, &self.config.tenant_tag).await?;

        let Prepared {
            reconciliation,
            mut merged,
            healed,
            batch,
        } = self.prepare(&loaded, false).await?;

        let applied = apply_batch(self.resources.as_ref(), &batch, &mut merged).await?;

        persist_pass(
            self.state.as_ref(),
            &merged,
            &applied.deleted_ids,
            &reconciliation.excluded_keys(),
            &reconciliation.new_states,
        )
        .await?;

        let report = DeploymentReport {
            changes: reconciliation.changes,
            created: applied.created,
            updated: applied.updated,
            deleted: applied.deleted_ids.len(),
            healed,
        };
        tracing::info!(
            "deploy: pass complete, {} process key(s), {} created, {} updated, {} deleted, {} healed",
            report.changes.len(),
            report.created,
            report.updated,
            report.deleted,
            report.healed
        );
        Ok(report)
    }

    /// Compute the state changes and batch of a pass without deploying,
    /// touching the registry, writing to the store or persisting.
    pub async fn plan(&self, plugins: &[ProcessPlugin]) -> Result<DeploymentPlan> {
        let _pass = self.pass.try_lock().map_err(|_| DeployError::PassInProgress)?;

        let loaded = LoadedPlugins::from_plugins(plugins);
        let prepared = self.prepare(&loaded, true).await?;

        Ok(DeploymentPlan {
            changes: prepared.reconciliation.changes,
            healed: prepared.healed,
            batch: prepared.batch,
        })
    }

    async fn prepare(&self, loaded: &LoadedPlugins, dry_run: bool) -> Result<Prepared> {
        let sets = loaded.key_sets(
            self.config.exclude.iter().cloned(),
            self.config.retire.iter().cloned(),
        );
        let reconciliation =
            reconcile_registry(self.registry.as_ref(), self.state.as_ref(), &sets, dry_run)
                .await?;

        for change in &reconciliation.changes {
            tracing::debug!(
                "state: {} {} → {}",
                change.key,
                change.old_state,
                change.new_state
            );
        }

        let stored = self
            .state
            .get_artifact_records()
            .await
            .map_err(DeployError::StateStore)?;
        let mut merged = merge_artifacts(
            &reconciliation.changes,
            &MergeInput {
                declared: &loaded.declared,
                stored: &stored,
            },
        );

        let healed = verify_existence(self.resources.as_ref(), &mut merged).await?;
        fetch_stored_content(self.resources.as_ref(), &mut merged).await?;
        let batch = build_batch(&merged)?;

        Ok(Prepared {
            reconciliation,
            merged,
            healed,
            batch,
        })
    }
}
