//! Batch diff and builder: merged artifact states → one ordered batch of
//! conditional writes against the resource store.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{DeployError, Result};
use crate::merge::ArtifactMap;
use crate::state::LifecycleState;
use crate::types::{ArtifactIdentity, OwnedArtifact};

// ─── Wire items ───────────────────────────────────────────────

/// One request inside a batch. Every item addresses its artifact by
/// natural key, never by store id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchItem {
    ConditionalCreate {
        identity: ArtifactIdentity,
        resource: serde_json::Value,
    },
    ConditionalUpdate {
        identity: ArtifactIdentity,
        resource: serde_json::Value,
    },
    ConditionalDelete {
        identity: ArtifactIdentity,
    },
    CountQuery {
        identity: ArtifactIdentity,
    },
    /// Search returning the stored resource, for artifacts whose content
    /// is no longer declared by any loaded plugin.
    Read {
        identity: ArtifactIdentity,
    },
}

impl BatchItem {
    pub fn identity(&self) -> &ArtifactIdentity {
        match self {
            Self::ConditionalCreate { identity, .. }
            | Self::ConditionalUpdate { identity, .. }
            | Self::ConditionalDelete { identity }
            | Self::CountQuery { identity }
            | Self::Read { identity } => identity,
        }
    }
}

impl fmt::Display for BatchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = self.identity();
        let kind = identity.kind();
        let condition = identity.condition();
        match self {
            Self::ConditionalCreate { .. } => {
                write!(f, "POST {kind} (If-None-Exist: {condition})")
            }
            Self::ConditionalUpdate { .. } => write!(f, "PUT {kind}?{condition}"),
            Self::ConditionalDelete { .. } => write!(f, "DELETE {kind}?{condition}"),
            Self::CountQuery { .. } => write!(f, "GET {kind}?{condition}&_summary=count"),
            Self::Read { .. } => write!(f, "GET {kind}?{condition}"),
        }
    }
}

/// Per-item response, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: u16,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl BatchResult {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            location: None,
            payload: None,
        }
    }

    pub fn with_location(status: u16, location: impl Into<String>) -> Self {
        Self {
            status,
            location: Some(location.into()),
            payload: None,
        }
    }
}

// ─── Actions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Create,
    Update,
    Delete,
}

impl BatchAction {
    pub fn expected_statuses(self) -> &'static [u16] {
        match self {
            Self::Create => &[200, 201],
            Self::Update => &[200],
            Self::Delete => &[200, 204],
        }
    }
}

/// Action for an artifact moving from `old` to `new`. Pairs without an
/// action never reach the builder; seeing one is a bug.
pub fn action_for(old: LifecycleState, new: LifecycleState) -> Result<BatchAction> {
    use LifecycleState::*;

    match (old, new) {
        (Missing, Active | Retired)
        | (New, Active | Draft | Retired)
        | (Excluded, Active | Draft | Retired) => Ok(BatchAction::Create),

        (Active, Draft | Retired) | (Draft, Active | Draft | Retired) | (Retired, Active | Draft) => {
            Ok(BatchAction::Update)
        }

        (Active | Draft | Retired, Excluded) => Ok(BatchAction::Delete),

        (old, new) => Err(DeployError::InvalidTransition { old, new }),
    }
}

/// Whether the artifact needs a write at all. Draft artifacts are always
/// rewritten to pick up content changes; an artifact nobody created and
/// nobody wants is skipped.
pub fn needs_write(artifact: &OwnedArtifact) -> bool {
    use LifecycleState::*;

    match (artifact.old_state, artifact.new_state) {
        (New, Excluded) => false,
        (Draft, Draft) => true,
        (old, new) => old != new,
    }
}

// ─── Batch ────────────────────────────────────────────────────

/// A batch item together with what the applier needs to check its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub action: BatchAction,
    pub identity: ArtifactIdentity,
    /// Store id before the batch runs; collected on delete.
    pub prior_store_id: Option<Uuid>,
    pub item: BatchItem,
}

impl BatchEntry {
    pub fn expected_statuses(&self) -> &'static [u16] {
        self.action.expected_statuses()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn items(&self) -> Vec<BatchItem> {
        self.entries.iter().map(|e| e.item.clone()).collect()
    }

    pub fn count(&self, action: BatchAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Full request body, for operators replaying a failed batch by hand.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.items())
            .unwrap_or_else(|e| format!("<unserializable batch: {e}>"))
    }
}

/// Build the batch for every merged artifact that needs a write, ordered
/// by resource kind so referenced artifacts are written first.
///
/// A create or update with no content to send is left out with a warning.
/// The artifact keeps its stored record and is retried next pass.
pub fn build_batch(merged: &ArtifactMap) -> Result<Batch> {
    let mut candidates: Vec<&OwnedArtifact> =
        merged.values().filter(|a| needs_write(a)).collect();
    candidates.sort_by_key(|a| a.kind().sort_priority());

    let mut entries = Vec::with_capacity(candidates.len());
    for artifact in candidates {
        if let Some(entry) = build_entry(artifact)? {
            entries.push(entry);
        }
    }

    Ok(Batch { entries })
}

fn build_entry(artifact: &OwnedArtifact) -> Result<Option<BatchEntry>> {
    let action = action_for(artifact.old_state, artifact.new_state)?;
    let identity = artifact.identity.clone();

    if action != BatchAction::Delete && artifact.payload.is_none() {
        tracing::warn!(
            "batch: skipping {:?} of {} ({} → {}), no content available",
            action,
            identity,
            artifact.old_state,
            artifact.new_state
        );
        return Ok(None);
    }

    let item = match action {
        BatchAction::Create => BatchItem::ConditionalCreate {
            identity: identity.clone(),
            resource: artifact.payload_with_status()?,
        },
        BatchAction::Update => BatchItem::ConditionalUpdate {
            identity: identity.clone(),
            resource: artifact.payload_with_status()?,
        },
        BatchAction::Delete => BatchItem::ConditionalDelete {
            identity: identity.clone(),
        },
    };

    tracing::debug!(
        "batch: {} {} ({} → {})",
        item,
        artifact.kind(),
        artifact.old_state,
        artifact.new_state
    );

    Ok(Some(BatchEntry {
        action,
        identity,
        prior_store_id: artifact.store_id,
        item,
    }))
}
