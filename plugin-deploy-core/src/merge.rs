//! Artifact ownership merger.
//!
//! Folds the artifacts of every process key into one map keyed by natural
//! identity. When several processes declare the same artifact, the highest
//! priority new state wins, so no single low-priority owner can force a
//! delete while another owner still needs the artifact.
//!
//! The old state is only raised by owners that know the artifact's store
//! id. An owner that introduces the artifact for the first time reports an
//! "unknown" old state, which must not outrank a stored one. The two
//! exceptions, the forced `New` for draft-stable processes and the later
//! `Missing` demotion, intentionally bypass that guard: together they decide
//! create versus update.

use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::state::{LifecycleState, StateChange};
use crate::types::{ArtifactIdentity, ArtifactRecord, DeclaredArtifact, OwnedArtifact, ProcessKey};

pub type ArtifactMap = BTreeMap<ArtifactIdentity, OwnedArtifact>;

/// An artifact yielded by one process in one pass, before merging.
#[derive(Debug, Clone)]
struct Candidate {
    identity: ArtifactIdentity,
    payload: Option<serde_json::Value>,
    store_id: Option<Uuid>,
}

/// Merge inputs: what loaded plugins declare and what the store already
/// holds, both per process key.
pub struct MergeInput<'a> {
    pub declared: &'a BTreeMap<ProcessKey, Vec<DeclaredArtifact>>,
    pub stored: &'a BTreeMap<ProcessKey, Vec<ArtifactRecord>>,
}

impl<'a> MergeInput<'a> {
    /// Loaded processes yield their declared artifacts, matched against the
    /// key's stored records. Unloaded processes yield their stored records.
    fn candidates(&self, key: &ProcessKey) -> Vec<Candidate> {
        let stored = self.stored.get(key).map(Vec::as_slice).unwrap_or_default();

        match self.declared.get(key) {
            Some(declared) => declared
                .iter()
                .map(|d| Candidate {
                    identity: d.identity.clone(),
                    payload: Some(d.payload.clone()),
                    store_id: stored
                        .iter()
                        .find(|r| r.identity == d.identity)
                        .map(|r| r.store_id),
                })
                .collect(),
            None => stored
                .iter()
                .map(|r| Candidate {
                    identity: r.identity.clone(),
                    payload: None,
                    store_id: Some(r.store_id),
                })
                .collect(),
        }
    }
}

/// Merge every state change's artifacts into one map.
pub fn merge_artifacts(changes: &[StateChange], input: &MergeInput<'_>) -> ArtifactMap {
    let mut merged = ArtifactMap::new();
    // Entries that exist only as a scheduled removal of a dropped draft
    // artifact. A later claimant replaces them outright.
    let mut removal_only: BTreeSet<ArtifactIdentity> = BTreeSet::new();

    for change in changes {
        let candidates = input.candidates(&change.key);
        let yielded: BTreeSet<&ArtifactIdentity> = candidates.iter().map(|c| &c.identity).collect();

        for candidate in &candidates {
            if removal_only.remove(&candidate.identity) {
                merged.remove(&candidate.identity);
            }
            merge_candidate(&mut merged, change, candidate.clone());
        }

        if change.is_draft_stable() {
            let dropped = input
                .stored
                .get(&change.key)
                .into_iter()
                .flatten()
                .filter(|r| !yielded.contains(&r.identity));

            for record in dropped {
                let inserted = insert_if_absent(
                    &mut merged,
                    OwnedArtifact {
                        identity: record.identity.clone(),
                        payload: None,
                        owning_processes: BTreeSet::from([change.key.clone()]),
                        store_id: Some(record.store_id),
                        old_state: LifecycleState::Draft,
                        new_state: LifecycleState::Excluded,
                    },
                );
                if inserted {
                    removal_only.insert(record.identity.clone());
                    tracing::debug!(
                        "merge: {} dropped from draft {}, scheduling removal",
                        record.identity,
                        change.key
                    );
                }
            }
        }
    }

    merged
}

fn merge_candidate(merged: &mut ArtifactMap, change: &StateChange, candidate: Candidate) {
    match merged.get_mut(&candidate.identity) {
        Some(existing) => {
            existing.owning_processes.insert(change.key.clone());

            if change.new_state.is_higher_priority(existing.new_state) {
                existing.new_state = change.new_state;
            }
            if candidate.store_id.is_some() && change.old_state.is_higher_priority(existing.old_state)
            {
                existing.old_state = change.old_state;
            }
            if existing.store_id.is_none() {
                existing.store_id = candidate.store_id;
            }
            if existing.payload.is_none() {
                existing.payload = candidate.payload;
            }
        }
        None => {
            let old_state = if change.is_draft_stable() && candidate.store_id.is_none() {
                // Still draft, but the artifact itself is new: create it.
                LifecycleState::New
            } else {
                change.old_state
            };

            tracing::debug!(
                "merge: {} first seen via {} ({} → {})",
                candidate.identity,
                change.key,
                old_state,
                change.new_state
            );

            merged.insert(
                candidate.identity.clone(),
                OwnedArtifact {
                    identity: candidate.identity,
                    payload: candidate.payload,
                    owning_processes: BTreeSet::from([change.key.clone()]),
                    store_id: candidate.store_id,
                    old_state,
                    new_state: change.new_state,
                },
            );
        }
    }
}

/// Insert only when no owner claims the identity yet. Returns whether the
/// artifact was inserted. An existing claim always outranks a removal
/// scheduled for a dropped draft artifact, and `merge_artifacts` discards
/// such a removal when a claim arrives later.
pub fn insert_if_absent(merged: &mut ArtifactMap, artifact: OwnedArtifact) -> bool {
    match merged.entry(artifact.identity.clone()) {
        std::collections::btree_map::Entry::Occupied(_) => false,
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(artifact);
            true
        }
    }
}
