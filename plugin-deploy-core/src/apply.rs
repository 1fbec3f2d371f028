//! Batch applier and result mapper.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::batch::{Batch, BatchAction, BatchResult};
use crate::error::{DeployError, Result};
use crate::merge::ArtifactMap;
use crate::ports::{ResourceStore, StateStore};
use crate::state::LifecycleState;
use crate::types::{OwnedArtifact, ProcessKey, ResourceKind};

/// What a successfully applied batch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedBatch {
    pub created: usize,
    pub updated: usize,
    pub deleted_ids: Vec<Uuid>,
}

/// Execute `batch` as one request and fold the results back into `merged`.
///
/// Created and updated artifacts get their store id refreshed from the
/// result location. Deleted artifacts lose theirs; the prior id is returned
/// in `deleted_ids`. On any failure the full batch is logged for replay and
/// `merged` is left as it was.
pub async fn apply_batch(
    store: &dyn ResourceStore,
    batch: &Batch,
    merged: &mut ArtifactMap,
) -> Result<AppliedBatch> {
    if batch.is_empty() {
        tracing::info!("batch: nothing to apply");
        return Ok(AppliedBatch::default());
    }

    tracing::info!(
        "batch: applying {} item(s) ({} create, {} update, {} delete)",
        batch.len(),
        batch.count(BatchAction::Create),
        batch.count(BatchAction::Update),
        batch.count(BatchAction::Delete)
    );

    let outcome = match store.execute_batch(&batch.items()).await {
        Ok(results) => map_results(batch, &results),
        Err(e) => Err(DeployError::ResourceStore(e)),
    };

    let mapped = match outcome {
        Ok(mapped) => mapped,
        Err(e) => {
            tracing::error!("batch failed: {}; intended batch:\n{}", e, batch.to_json());
            return Err(e);
        }
    };

    let mut applied = AppliedBatch::default();
    for (entry, store_id) in batch.entries.iter().zip(mapped) {
        let Some(artifact) = merged.get_mut(&entry.identity) else {
            continue;
        };
        match entry.action {
            BatchAction::Create | BatchAction::Update => {
                artifact.store_id = store_id;
                if entry.action == BatchAction::Create {
                    applied.created += 1;
                } else {
                    applied.updated += 1;
                }
            }
            BatchAction::Delete => {
                artifact.store_id = None;
                if let Some(id) = entry.prior_store_id {
                    applied.deleted_ids.push(id);
                }
            }
        }
    }

    Ok(applied)
}

/// Validate every result against its entry. Yields the store id for
/// created/updated items and `None` for deletes.
fn map_results(batch: &Batch, results: &[BatchResult]) -> Result<Vec<Option<Uuid>>> {
    if results.len() != batch.len() {
        return Err(DeployError::BatchResultCount {
            expected: batch.len(),
            actual: results.len(),
        });
    }

    batch
        .entries
        .iter()
        .zip(results)
        .enumerate()
        .map(|(index, (entry, result))| {
            let expected = entry.expected_statuses();
            if !expected.contains(&result.status) {
                return Err(DeployError::UnexpectedStatus {
                    index,
                    status: result.status,
                    expected,
                });
            }
            match entry.action {
                BatchAction::Delete => Ok(None),
                BatchAction::Create | BatchAction::Update => {
                    let location = result.location.as_deref().ok_or_else(|| {
                        DeployError::InvalidLocation(format!("item {index} has no location"))
                    })?;
                    let id = parse_location(location, entry.identity.kind())?;
                    Ok(Some(id))
                }
            }
        })
        .collect()
}

/// Extract the store id from `Kind/id`, `Kind/id/_history/n` or an absolute
/// URL ending in either, checking the kind.
pub fn parse_location(location: &str, expected: ResourceKind) -> Result<Uuid> {
    let path = location.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let end = match segments.iter().rposition(|s| *s == "_history") {
        Some(history) => history,
        None => segments.len(),
    };
    if end < 2 {
        return Err(DeployError::InvalidLocation(location.to_string()));
    }

    let (kind, id) = (segments[end - 2], segments[end - 1]);
    if kind != expected.as_str() {
        return Err(DeployError::UnexpectedResourceKind {
            expected,
            actual: kind.to_string(),
        });
    }

    Uuid::parse_str(id).map_err(|_| DeployError::InvalidLocation(location.to_string()))
}

/// Persist the authoritative artifact and process state after a confirmed
/// batch, in one store call.
pub async fn persist_pass(
    state: &dyn StateStore,
    merged: &ArtifactMap,
    deleted_ids: &[Uuid],
    excluded_keys: &[ProcessKey],
    states: &BTreeMap<ProcessKey, LifecycleState>,
) -> Result<()> {
    let artifacts: Vec<OwnedArtifact> = merged.values().cloned().collect();
    state
        .commit_pass(&artifacts, deleted_ids, excluded_keys, states)
        .await
        .map_err(DeployError::StateStore)
}
