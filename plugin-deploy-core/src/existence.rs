//! Pre-batch queries against the resource store.
//!
//! Artifacts whose state does not change are assumed to exist. Before
//! trusting that, ask the store: anything deleted out-of-band is demoted to
//! `Missing` so the batch builder re-creates it.
//!
//! Artifacts recovered only from stored records carry no content. When such
//! an artifact still has to be written, its current resource is read back
//! from the store so only the status changes.

use crate::batch::{needs_write, BatchItem, BatchResult};
use crate::error::{DeployError, Result};
use crate::merge::ArtifactMap;
use crate::ports::ResourceStore;
use crate::state::LifecycleState;
use crate::types::ArtifactIdentity;

fn expected_to_exist(old: LifecycleState, new: LifecycleState) -> bool {
    old == new && matches!(old, LifecycleState::Active | LifecycleState::Retired)
}

/// Run read-only items as one batch and check the reply shape.
async fn query(store: &dyn ResourceStore, items: &[BatchItem]) -> Result<Vec<BatchResult>> {
    let results = store
        .execute_batch(items)
        .await
        .map_err(DeployError::ResourceStore)?;

    if results.len() != items.len() {
        return Err(DeployError::BatchResultCount {
            expected: items.len(),
            actual: results.len(),
        });
    }
    Ok(results)
}

/// Query the store for every stable artifact and demote the missing ones.
/// Returns the number of demoted artifacts.
///
/// Individual query failures are logged and leave the artifact untouched.
/// A store that cannot execute the batch at all fails the pass. A missing
/// artifact without content is left as is, since it could not be
/// re-created.
pub async fn verify_existence(store: &dyn ResourceStore, merged: &mut ArtifactMap) -> Result<usize> {
    let checked: Vec<ArtifactIdentity> = merged
        .values()
        .filter(|a| expected_to_exist(a.old_state, a.new_state))
        .map(|a| a.identity.clone())
        .collect();

    if checked.is_empty() {
        return Ok(0);
    }

    let items: Vec<BatchItem> = checked
        .iter()
        .map(|identity| BatchItem::CountQuery {
            identity: identity.clone(),
        })
        .collect();
    let results = query(store, &items).await?;

    let mut demoted = 0;
    for ((identity, item), result) in checked.iter().zip(&items).zip(&results) {
        if result.status != 200 {
            tracing::warn!(
                "existence check {} returned status {}, assuming present",
                item,
                result.status
            );
            continue;
        }

        let total = result
            .payload
            .as_ref()
            .and_then(|p| p.get("total"))
            .and_then(serde_json::Value::as_u64);

        match total {
            Some(0) => {
                let Some(artifact) = merged.get_mut(identity) else {
                    continue;
                };
                if artifact.payload.is_none() {
                    tracing::warn!(
                        "{} is {} but missing from the store, and no loaded plugin declares it",
                        identity,
                        artifact.old_state
                    );
                    continue;
                }
                tracing::info!(
                    "{} is {} but missing from the store, will re-create",
                    identity,
                    artifact.old_state
                );
                artifact.old_state = LifecycleState::Missing;
                demoted += 1;
            }
            Some(_) => {}
            None => {
                tracing::warn!("existence check {} returned no total, assuming present", item);
            }
        }
    }

    Ok(demoted)
}

/// Read back the stored resource of every artifact that needs a create or
/// update but has no content. Returns the number of artifacts filled in.
/// Artifacts the store does not return stay empty; the batch builder skips
/// them.
pub async fn fetch_stored_content(store: &dyn ResourceStore, merged: &mut ArtifactMap) -> Result<usize> {
    let wanted: Vec<ArtifactIdentity> = merged
        .values()
        .filter(|a| a.payload.is_none() && a.new_state != LifecycleState::Excluded && needs_write(a))
        .map(|a| a.identity.clone())
        .collect();

    if wanted.is_empty() {
        return Ok(0);
    }

    let items: Vec<BatchItem> = wanted
        .iter()
        .map(|identity| BatchItem::Read {
            identity: identity.clone(),
        })
        .collect();
    let results = query(store, &items).await?;

    let mut fetched = 0;
    for ((identity, item), result) in wanted.iter().zip(&items).zip(&results) {
        let resource = match (result.status, result.payload.as_ref()) {
            (200, Some(payload)) => first_resource(payload),
            _ => None,
        };
        match (resource, merged.get_mut(identity)) {
            (Some(resource), Some(artifact)) => {
                tracing::debug!("{} content read back from the store", identity);
                artifact.payload = Some(resource);
                fetched += 1;
            }
            _ => {
                tracing::warn!(
                    "read {} returned status {} and no resource",
                    item,
                    result.status
                );
            }
        }
    }

    Ok(fetched)
}

/// The resource itself, or the first entry of a search bundle.
fn first_resource(payload: &serde_json::Value) -> Option<serde_json::Value> {
    if payload.get("resourceType").and_then(serde_json::Value::as_str) != Some("Bundle") {
        return Some(payload.clone());
    }
    payload
        .get("entry")
        .and_then(serde_json::Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("resource"))
        .cloned()
}
